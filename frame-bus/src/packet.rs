use bytes::Bytes;

/// One compressed access unit as read from a stream source. Timestamps are
/// in the source stream's time base.
#[derive(Clone, Debug, Default)]
pub struct Packet {
    data: Bytes,
    pts: Option<i64>,
    dts: Option<i64>,
    is_key: bool,
}

impl Packet {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn with_timestamps(mut self, pts: Option<i64>, dts: Option<i64>) -> Self {
        self.pts = pts;
        self.dts = dts;
        self
    }

    pub fn with_key(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn dts(&self) -> Option<i64> {
        self.dts
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }
}
