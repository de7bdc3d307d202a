//! Gapless port extensions

use super::delay_buffer::DelayBuffer;
use streamsync_common::MediaFormat;

/// Whether inputs run through delay lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SwitchMode {
    /// No delay line yet; the active input is copied straight to the output
    #[default]
    PassThrough,
    /// Every configured input owns a delay line
    Buffered,
}

#[derive(Default)]
pub struct GaplessInPort {
    pub(crate) media_format: Option<MediaFormat>,
    pub(crate) delay: Option<DelayBuffer>,
    /// Valid input timestamp already reported for this start
    pub(crate) timestamp_warned: bool,
    /// Data from this stream reached the output since the port started
    pub(crate) emitted_since_start: bool,
}

impl GaplessInPort {
    pub fn media_format(&self) -> Option<MediaFormat> {
        self.media_format
    }

    pub fn delay_buffer(&self) -> Option<&DelayBuffer> {
        self.delay.as_ref()
    }

    pub fn has_emitted(&self) -> bool {
        self.emitted_since_start
    }

    pub(crate) fn has_buffered_data(&self) -> bool {
        self.delay.as_ref().is_some_and(|d| !d.is_idle())
    }
}
