pub mod key_manager;
pub mod key_rotator;
