pub mod events;
pub mod health;
pub mod push;
pub mod rules;
pub mod stats;
