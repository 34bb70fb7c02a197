mod spool;
mod status;
mod traits;

pub use spool::SpoolPackageTarget;
pub use status::{
    AdviseCookie, PackageCompletion, PackageStatus, StatusDispatcher, StatusPublisher,
    StatusRelay, StatusSink,
};
pub use traits::{
    CancelToken, DocumentPackageTarget, JOB_PAGE_APPLICATION_DEFINED, PackageWriter,
    PageCountType, PageDescription, PreviewTarget, PrintTaskOptions, UniformTaskOptions,
};
