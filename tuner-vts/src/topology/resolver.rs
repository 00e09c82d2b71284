//! Enumeration of device combinations under compatibility rules.
//!
//! A scenario declares one [`Pool`] per role. [`resolve`] takes the
//! Cartesian product of the pools in odometer order (the last role cycles
//! fastest), represents an unused optional role as `None`, and keeps the
//! combinations every [`Rule`] accepts.

use std::sync::Arc;

/// Candidates for one role.
#[derive(Debug, Clone)]
pub struct Pool<T> {
    pub role: &'static str,
    pub candidates: Vec<T>,
    /// Optional roles may also be left absent.
    pub optional: bool,
}

impl<T> Pool<T> {
    pub fn required(role: &'static str, candidates: Vec<T>) -> Self {
        Self { role, candidates, optional: false }
    }

    pub fn optional(role: &'static str, candidates: Vec<T>) -> Self {
        Self { role, candidates, optional: true }
    }
}

/// One tuple of the product: a value, or `None` for an absent role, per pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Combination<T> {
    roles: Arc<[&'static str]>,
    values: Vec<Option<T>>,
}

impl<T> Combination<T> {
    /// Value bound to `role`; `None` when absent or the role is unknown.
    pub fn get(&self, role: &str) -> Option<&T> {
        self.roles
            .iter()
            .position(|r| *r == role)
            .and_then(|i| self.values[i].as_ref())
    }

    pub fn is_present(&self, role: &str) -> bool {
        self.get(role).is_some()
    }

    pub fn values(&self) -> &[Option<T>] {
        &self.values
    }
}

/// Named compatibility predicate over a full combination.
pub struct Rule<'r, T> {
    pub name: &'static str,
    predicate: Box<dyn Fn(&Combination<T>) -> bool + 'r>,
}

impl<'r, T> Rule<'r, T> {
    pub fn new(name: &'static str, predicate: impl Fn(&Combination<T>) -> bool + 'r) -> Self {
        Self { name, predicate: Box::new(predicate) }
    }

    pub fn accepts(&self, combination: &Combination<T>) -> bool {
        (self.predicate)(combination)
    }
}

/// Cartesian product of `lists` in odometer order.
///
/// Returns an empty product when there are no lists or any list is empty.
pub fn cartesian<T: Clone>(lists: &[Vec<T>]) -> Vec<Vec<T>> {
    if lists.is_empty() || lists.iter().any(Vec::is_empty) {
        return Vec::new();
    }
    let total = lists.iter().map(Vec::len).product();
    let mut out = Vec::with_capacity(total);
    let mut digits = vec![0usize; lists.len()];
    loop {
        out.push(
            digits
                .iter()
                .zip(lists)
                .map(|(&digit, list)| list[digit].clone())
                .collect(),
        );
        let mut pos = lists.len();
        loop {
            if pos == 0 {
                return out;
            }
            pos -= 1;
            digits[pos] += 1;
            if digits[pos] < lists[pos].len() {
                break;
            }
            digits[pos] = 0;
        }
    }
}

/// Enumerate every combination of `pools` accepted by all `rules`.
pub fn resolve<T: Clone>(pools: &[Pool<T>], rules: &[Rule<'_, T>]) -> Vec<Combination<T>> {
    let roles: Arc<[&'static str]> = pools.iter().map(|p| p.role).collect();
    let lists: Vec<Vec<Option<T>>> = pools
        .iter()
        .map(|pool| {
            let mut list: Vec<Option<T>> = pool.candidates.iter().cloned().map(Some).collect();
            if pool.optional {
                list.push(None);
            }
            list
        })
        .collect();

    cartesian(&lists)
        .into_iter()
        .map(|values| Combination { roles: Arc::clone(&roles), values })
        .filter(|combination| rules.iter().all(|rule| rule.accepts(combination)))
        .collect()
}

/// Use the pinned configuration when present, otherwise enumerate.
pub fn resolve_or_pinned<C>(pinned: Option<&C>, generate: impl FnOnce() -> Vec<C>) -> Vec<C>
where
    C: Clone,
{
    match pinned {
        Some(connection) => vec![connection.clone()],
        None => generate(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_odometer_order() {
        let product = cartesian(&[vec![1, 2], vec![10, 20, 30]]);
        assert_eq!(
            product,
            vec![
                vec![1, 10],
                vec![1, 20],
                vec![1, 30],
                vec![2, 10],
                vec![2, 20],
                vec![2, 30],
            ]
        );
    }

    #[test]
    fn test_product_size_without_rules() {
        let pools = vec![
            Pool::required("a", strings(&["a1", "a2"])),
            Pool::required("b", strings(&["b1", "b2", "b3"])),
            Pool::required("c", strings(&["c1", "c2"])),
        ];
        assert_eq!(resolve(&pools, &[]).len(), 12);
    }

    #[test]
    fn test_optional_role_adds_absent_sentinel() {
        let pools = vec![
            Pool::required("a", strings(&["a1", "a2"])),
            Pool::required("b", strings(&["b1", "b2", "b3"])),
            Pool::optional("c", strings(&["c1", "c2"])),
        ];
        let combos = resolve(&pools, &[]);
        assert_eq!(combos.len(), 2 * 3 * 3);
        assert_eq!(combos.iter().filter(|c| !c.is_present("c")).count(), 6);
        // The sentinel is enumerated last within its role.
        assert_eq!(combos[2].get("c"), None);
        assert_eq!(combos[0].get("c").map(String::as_str), Some("c1"));
    }

    #[test]
    fn test_empty_required_pool_yields_nothing() {
        let pools = vec![
            Pool::required("a", strings(&["a1"])),
            Pool::required("b", Vec::new()),
        ];
        assert!(resolve(&pools, &[]).is_empty());
    }

    #[test]
    fn test_empty_optional_pool_is_absent_only() {
        let pools = vec![
            Pool::required("a", strings(&["a1", "a2"])),
            Pool::optional("b", Vec::<String>::new()),
        ];
        let combos = resolve(&pools, &[]);
        assert_eq!(combos.len(), 2);
        assert!(combos.iter().all(|c| !c.is_present("b")));
    }

    #[test]
    fn test_rule_removes_exactly_its_matches() {
        let pools = vec![
            Pool::required("a", strings(&["a1", "a2"])),
            Pool::required("b", strings(&["b1", "b2"])),
        ];
        let rule = Rule::new("no a2 with b1", |c: &Combination<String>| {
            !(c.get("a").map(String::as_str) == Some("a2")
                && c.get("b").map(String::as_str) == Some("b1"))
        });
        let all = resolve(&pools, &[]);
        let filtered = resolve(&pools, &[rule]);
        assert_eq!(filtered.len(), all.len() - 1);
        assert!(filtered.iter().all(|c| all.contains(c)));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let pools = vec![
            Pool::optional("a", strings(&["x", "y"])),
            Pool::required("b", strings(&["1", "2", "3"])),
        ];
        assert_eq!(resolve(&pools, &[]), resolve(&pools, &[]));
    }

    #[test]
    fn test_pinned_configuration_skips_generation() {
        let pinned = "pinned".to_string();
        let out = resolve_or_pinned(Some(&pinned), || panic!("generation must not run"));
        assert_eq!(out, vec![pinned]);
        let generated = resolve_or_pinned(None, || vec!["a".to_string(), "b".to_string()]);
        assert_eq!(generated.len(), 2);
    }
}
