pub mod campaign;
pub mod conversation;
pub mod enrollment;
pub mod lead;
pub mod message;
