pub mod common;
pub mod dump;
pub mod ir;
pub mod synth;
