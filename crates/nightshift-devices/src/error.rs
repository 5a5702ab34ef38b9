use nightshift_types::TaskError;

/// Errors reported by device operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("device not connected: {0}")]
    NotConnected(String),

    #[error("device busy: {0}")]
    Busy(String),

    #[error("device fault: {0}")]
    Fault(String),

    #[error("device operation timed out: {0}")]
    Timeout(String),
}

impl From<DeviceError> for TaskError {
    fn from(err: DeviceError) -> Self {
        TaskError::Device(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightshift_types::TaskErrorKind;

    #[test]
    fn converts_to_device_task_error() {
        let err: TaskError = DeviceError::Fault("shutter stuck".into()).into();
        assert_eq!(err.kind(), TaskErrorKind::Device);
        assert!(err.to_string().contains("shutter stuck"));
    }
}
