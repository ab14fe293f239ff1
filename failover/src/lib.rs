#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod aggregator;
pub mod detector;
pub mod orchestrator;
pub mod probe;
pub mod report;
pub mod workers;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

pub use aggregator::Aggregator;
pub use detector::{DetectorEvent, FailureDetector, Transition};
pub use orchestrator::{FailoverTest, FatalError};
pub use report::{default_report_path, to_csv_writer, write_csv, ReportError};

#[cfg(feature = "postgres")]
pub use postgres::PgBackend;

pub mod prelude {
    pub use crate::orchestrator::{FailoverTest, FatalError};
    pub use failover_core::{
        Backend, BackendError, DatabaseConfig, PoolMode, TestConfig, TestReport,
    };

    #[cfg(feature = "postgres")]
    pub use crate::postgres::PgBackend;
}
