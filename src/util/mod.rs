pub mod region;

pub use region::RawRegion;
