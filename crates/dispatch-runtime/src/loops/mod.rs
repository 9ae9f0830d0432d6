//! Background loops for continuous processing.

pub mod flight_loop;
