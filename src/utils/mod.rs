//! The `utils` module holds definitions shared across `fanmq`: the crate
//! error type and logging setup.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::error::Error;
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }

    #[test]
    fn parse_level_falls_back_to_info() {
        assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
        assert_eq!(logging::parse_level("trace"), tracing::Level::TRACE);
        assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
    }

    #[test]
    fn error_messages_name_the_offending_value() {
        let err = Error::MalformedSubject("event//x".to_string());
        assert_eq!(err.to_string(), "malformed subject \"event//x\"");
        assert_eq!(
            Error::NoSubjects.to_string(),
            "at least one subject is required"
        );
    }
}
