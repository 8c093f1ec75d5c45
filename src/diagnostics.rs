//! Error reporting for failures the manager surfaces to the host.

use std::error::Error;
use tracing::error;

/// `err` followed by each of its sources, joined with `": "`.
pub fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        // thiserror messages often already embed their source
        if !chain.ends_with(&cause_text) {
            chain.push_str(": ");
            chain.push_str(&cause_text);
        }
        source = cause.source();
    }
    chain
}

/// Log a failure together with what was being attempted.
pub fn report_error(context: &str, err: &(dyn Error + 'static)) {
    error!(error = %error_chain(err), "{}", context);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortError;
    use std::io;

    #[test]
    fn test_chain_includes_sources() {
        let err = PortError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "cable pulled"));
        let chain = error_chain(&err);
        assert!(chain.starts_with("I/O error"));
        assert!(chain.ends_with("cable pulled"));
        assert_eq!(chain.matches("cable pulled").count(), 1);
    }

    #[test]
    fn test_plain_error() {
        let err = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(error_chain(&err), "boom");
        report_error("while testing", &err);
    }
}
