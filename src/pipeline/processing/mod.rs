// Per-record stages: normalize -> identity -> validation -> quality

pub mod identity;
pub mod normalize;
pub mod quality;
pub mod validation;
