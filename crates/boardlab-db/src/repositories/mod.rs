//! PostgreSQL repository implementations.

pub mod device;
pub mod job;
pub mod test_case;
pub mod worker;

pub use device::PgDeviceRepository;
pub use job::PgJobRepository;
pub use test_case::PgTestCaseRepository;
pub use worker::PgWorkerRepository;
