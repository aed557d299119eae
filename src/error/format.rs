use crate::error::{ErrorContext, PortlockError};

pub fn format_error_chain(error: &PortlockError) -> String {
    let context = ErrorContext::new(error);
    context.to_string()
}
