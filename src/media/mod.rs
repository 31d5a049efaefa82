//! Raw-media helpers shared by the controller: PCM/MP3 conversion, WAV
//! header handling, silence measurement and I420 frame manipulation.

pub mod audio;
pub mod image;
