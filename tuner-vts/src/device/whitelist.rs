//! Result codes accepted per operation.
//!
//! Success is always accepted. Optional features may also answer with a
//! degraded code, which ends the scenario as skipped rather than failed.

use tuner_hal_protocol::{Operation, ResultCode};

use crate::error::ScenarioError;

/// Non-success codes accepted for `op`.
pub fn degraded_codes(op: Operation) -> &'static [ResultCode] {
    use ResultCode::*;
    match op {
        Operation::Scan | Operation::StopScan => &[NotSupported],
        Operation::GetFrontendStatus => &[NotSupported],
        Operation::LinkCiCam | Operation::UnlinkCiCam => &[Unavailable, NotSupported],
        Operation::RemoveOutputPid => &[Unavailable],
        Operation::ConfigureMonitorEvent | Operation::ConfigureIpCid => {
            &[NotSupported, Unavailable]
        }
        Operation::OpenTimeFilter => &[Unavailable, NotSupported],
        Operation::GetLnbIds | Operation::OpenLnbById | Operation::OpenLnbByName => &[Unavailable],
        Operation::OpenCasSession | Operation::OpenDescrambler => &[Unavailable],
        _ => &[],
    }
}

/// Classify the result code of a reply to `op`.
pub fn check(op: Operation, code: ResultCode) -> Result<(), ScenarioError> {
    if code.is_success() {
        Ok(())
    } else if degraded_codes(op).contains(&code) {
        Err(ScenarioError::Degraded { op, code })
    } else {
        Err(ScenarioError::Semantic { op, code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_always_passes() {
        assert!(check(Operation::Tune, ResultCode::Success).is_ok());
        assert!(check(Operation::OpenTimeFilter, ResultCode::Success).is_ok());
    }

    #[test]
    fn test_degraded_and_semantic() {
        assert!(matches!(
            check(Operation::Scan, ResultCode::NotSupported),
            Err(ScenarioError::Degraded { .. })
        ));
        assert!(matches!(
            check(Operation::Tune, ResultCode::NotSupported),
            Err(ScenarioError::Semantic { .. })
        ));
        assert!(matches!(
            check(Operation::RemoveOutputPid, ResultCode::Unavailable),
            Err(ScenarioError::Degraded { .. })
        ));
        assert!(matches!(
            check(Operation::GetAvSyncTime, ResultCode::InvalidArgument),
            Err(ScenarioError::Semantic { .. })
        ));
        assert!(matches!(
            check(Operation::OpenTimeFilter, ResultCode::Oem(0x1001)),
            Err(ScenarioError::Semantic { .. })
        ));
    }
}
