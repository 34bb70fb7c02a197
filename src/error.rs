pub type PrintResult<T> = Result<T, PrintError>;

#[derive(thiserror::Error, Debug)]
pub enum PrintError {
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("page {page} is out of range (document has {page_count} pages)")]
    UnsupportedPage { page: usize, page_count: usize },
    #[error("print canceled")]
    Canceled,
    #[error("package error: {0}")]
    Package(String),
    #[error("XML error: {context}")]
    Xml {
        context: String,
        #[source]
        source: quick_xml::Error,
    },
    #[error("zip error")]
    Zip(#[from] zip::result::ZipError),
    #[error("image error")]
    Image(#[from] image::ImageError),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("print document has been disposed")]
    Disposed,
}

impl From<std::io::Error> for PrintError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            source,
            context: "I/O operation failed".to_string(),
        }
    }
}

impl PrintError {
    pub fn io_with_context(source: std::io::Error, context: impl Into<String>) -> Self {
        Self::Io {
            source,
            context: context.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn unsupported_page(page: usize, page_count: usize) -> Self {
        Self::UnsupportedPage { page, page_count }
    }

    pub fn package(message: impl Into<String>) -> Self {
        Self::Package(message.into())
    }

    pub fn xml(context: impl Into<String>, source: quick_xml::Error) -> Self {
        Self::Xml {
            context: context.into(),
            source,
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// True when the failure is the spooler's "print canceled" condition.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_unsupported_page(&self) -> bool {
        matches!(self, Self::UnsupportedPage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::PrintError;

    #[test]
    fn io_error_keeps_context_and_source() {
        let err = PrintError::io_with_context(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "failed to open spool file",
        );
        assert_eq!(err.to_string(), "I/O error: failed to open spool file");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn canceled_is_distinguished_from_fatal_errors() {
        assert!(PrintError::Canceled.is_canceled());
        assert!(!PrintError::package("writer closed").is_canceled());
        assert!(PrintError::unsupported_page(999, 3).is_unsupported_page());
    }
}
