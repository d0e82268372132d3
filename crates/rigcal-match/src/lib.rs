//! Corner detection and patch matching.
//!
//! [`detector`] finds Harris corners at multiple octaves and refines them to
//! sub-pixel precision; [`matcher`] sweeps candidate disparities and accepts
//! mutual-best ZNCC matches between camera pairs; [`io`] reads and writes the
//! matches document.

/// Corners and ZNCC patches.
pub mod corner;
/// Multi-octave Harris corner detection.
pub mod detector;
/// Matches document I/O.
pub mod io;
/// Disparity-swept patch matching.
pub mod matcher;

pub use corner::*;
pub use detector::*;
pub use io::*;
pub use matcher::*;
