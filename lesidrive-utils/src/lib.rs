pub mod hexprint;
pub mod read_le;
pub mod write_le;
