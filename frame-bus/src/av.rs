use std::sync::Arc;

use crate::{
    backend::{ConversionStage, MediaBackend, OpenedStream},
    decoder::AvDecoder,
    error::Result,
    input::AvInput,
    scaler::SwsConverter,
};

/// libav*-backed demux, decode and `swscale` conversion.
pub struct AvBackend {
    prefer_hw: bool,
    converter: Arc<SwsConverter>,
}

impl AvBackend {
    pub fn new(prefer_hw: bool) -> Self {
        Self {
            prefer_hw,
            converter: Arc::new(SwsConverter::new()),
        }
    }
}

impl Default for AvBackend {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MediaBackend for AvBackend {
    fn open(&self, locator: &str) -> Result<OpenedStream> {
        let input = AvInput::open(locator)?;
        let decoder = AvDecoder::new(&input, self.prefer_hw)?;
        Ok(OpenedStream {
            source: Box::new(input),
            decoder: Box::new(decoder),
        })
    }

    fn converter(&self) -> Arc<dyn ConversionStage> {
        self.converter.clone()
    }
}
