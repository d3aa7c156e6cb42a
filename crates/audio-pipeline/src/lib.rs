//! Decode, convert, encode and stream audio for the media server.
//!
//! Files are opened as [`source::Source`]s, converted through a
//! [`resample::Resampler`] into a [`fifo::Fifo`] and encoded by an
//! [`encode::Sink`]. [`transcode::Transcoder`] drives that chain for one
//! request; [`player::Player`] runs it continuously for live listeners.

pub mod decode;
pub mod duration;
pub mod encode;
pub mod fifo;
pub mod format;
pub mod fragment;
pub mod player;
pub mod replaygain;
pub mod resample;
pub mod silence;
pub mod source;
pub mod transcode;
