use super::*;
use std::io;
use std::path::Path;

#[test]
fn timeout_is_distinct_from_failure() {
    let timeout = PortlockError::LockTimeout {
        path: "/shared/foo.vmx".to_string(),
        waited_secs: 3.5,
        details: "competitor holds an exclusive lock".to_string(),
    };
    assert!(timeout.is_timeout());

    let failure = PortlockError::LockAcquire {
        path: "/shared/foo.vmx".to_string(),
        details: "cannot create lock directory".to_string(),
    };
    assert!(!failure.is_timeout());
}

#[test]
fn io_errors_map_to_errno_taxonomy() {
    let path = Path::new("/shared/foo.vmx");

    let err = PortlockError::from_io(path, io::Error::from(io::ErrorKind::PermissionDenied));
    assert!(matches!(err, PortlockError::PermissionDenied(_)));

    let err = PortlockError::from_io(path, io::Error::from(io::ErrorKind::NotFound));
    assert!(matches!(err, PortlockError::NotFound(_)));

    let err = PortlockError::from_io(path, io::Error::from(io::ErrorKind::StorageFull));
    assert!(matches!(err, PortlockError::DiskSpaceError(_)));

    let err = PortlockError::from_io(path, io::Error::from(io::ErrorKind::TimedOut));
    assert!(matches!(err, PortlockError::Io(_)));
}

#[test]
fn exit_codes_separate_contention_from_failure() {
    let timeout = PortlockError::LockTimeout {
        path: "x".to_string(),
        waited_secs: 0.0,
        details: String::new(),
    };
    assert_eq!(get_exit_code(&timeout), 75);
    assert_eq!(
        get_exit_code(&PortlockError::PermissionDenied("x".to_string())),
        13
    );
    assert_eq!(
        get_exit_code(&PortlockError::SystemError("x".to_string())),
        1
    );
}

#[test]
fn error_chain_includes_suggestion() {
    let timeout = PortlockError::LockTimeout {
        path: "/shared/foo.vmx".to_string(),
        waited_secs: 1.0,
        details: "busy".to_string(),
    };
    let formatted = format_error_chain(&timeout);
    assert!(formatted.starts_with("Error:"));
    assert!(formatted.contains("Suggestion:"));
}
