use crate::error::PortlockError;

pub fn get_exit_code(error: &PortlockError) -> i32 {
    match error {
        PortlockError::ValidationError(_) | PortlockError::ConfigError(_) => 2,

        PortlockError::NotFound(_) => 4,

        PortlockError::PermissionDenied(_) => 13,

        PortlockError::DiskSpaceError(_) => 28,

        // Contention is a temporary condition, not a hard failure.
        PortlockError::LockTimeout { .. } => 75,

        _ => 1,
    }
}
