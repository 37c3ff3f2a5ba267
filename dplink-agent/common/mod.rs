pub mod aux;
pub mod delay;

pub use aux::{read_layout, write_layout, DevAux, DpAux};
pub use delay::{Delay, NoDelay, ThreadDelay};
