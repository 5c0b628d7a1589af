pub mod identity;
pub mod rbac;
