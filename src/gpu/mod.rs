//! Host GPU handling: legacy exclusivity and driver package lookup.

pub mod driver_source;
pub mod exclusivity;

pub use driver_source::{DriverSourceLocation, locate_driver_source};
pub use exclusivity::{ExclusivityCoordinator, Reservation};
