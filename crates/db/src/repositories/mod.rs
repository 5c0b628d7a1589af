mod job_repo;
mod ledger_repo;
mod review_repo;

pub use job_repo::JobRepo;
pub use ledger_repo::{ConsumeRow, LedgerRepo};
pub use review_repo::ReviewRepo;
