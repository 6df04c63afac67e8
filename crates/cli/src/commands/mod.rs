pub mod allocations;
pub mod health;
pub mod nodes;
