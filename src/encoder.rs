use anyhow::bail;
use bytes::BytesMut;

/// Cursor-addressed encoder / decoder over a message buffer.
///
/// Writes go through the cursor and extend the buffer as needed; the cursor can be
///  explicitly rewound to patch previously reserved bytes (this is how a channel stamps
///  the sequence index into a header slot that was skipped when the message was built).
///  Reads past the end of the buffer fail with a truncated-packet error and never panic -
///  inbound data is attacker-controlled.
///
/// All multi-byte values are big-endian.
#[derive(Debug, Clone)]
pub struct MessageEncoder {
    buf: BytesMut,
    position: usize,
}

impl MessageEncoder {
    pub fn new() -> MessageEncoder {
        MessageEncoder {
            buf: BytesMut::new(),
            position: 0,
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> MessageEncoder {
        MessageEncoder {
            buf: BytesMut::from(&data[..]),
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The bytes written so far, i.e. everything up to the cursor.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.position]
    }

    /// Reserves `count` bytes at the cursor (zero-filled) without writing a value;
    ///  the slot is typically patched later via [`MessageEncoder::set_position`].
    pub fn skip(&mut self, count: usize) {
        self.ensure(count);
        self.position += count;
    }

    fn ensure(&mut self, count: usize) {
        let end = self.position + count;
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.buf[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
    }

    fn take(&mut self, count: usize) -> anyhow::Result<&[u8]> {
        if self.position + count > self.buf.len() {
            bail!(
                "truncated packet: needed {} bytes at offset {}, buffer has {}",
                count,
                self.position,
                self.buf.len()
            );
        }

        let slice = &self.buf[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    // ---- fixed-width values ------------------------------------------------------------

    pub fn encode_u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    pub fn decode_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn encode_bool(&mut self, value: bool) {
        self.encode_u8(value as u8);
    }

    pub fn decode_bool(&mut self) -> anyhow::Result<bool> {
        Ok(self.decode_u8()? != 0)
    }

    pub fn encode_u16(&mut self, value: u16) {
        self.put(&value.to_be_bytes());
    }

    pub fn decode_u16(&mut self) -> anyhow::Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes(bytes.try_into()?))
    }

    pub fn encode_u32(&mut self, value: u32) {
        self.put(&value.to_be_bytes());
    }

    pub fn decode_u32(&mut self) -> anyhow::Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into()?))
    }

    pub fn encode_u64(&mut self, value: u64) {
        self.put(&value.to_be_bytes());
    }

    pub fn decode_u64(&mut self) -> anyhow::Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into()?))
    }

    pub fn encode_u128(&mut self, value: u128) {
        self.put(&value.to_be_bytes());
    }

    pub fn decode_u128(&mut self) -> anyhow::Result<u128> {
        let bytes = self.take(16)?;
        Ok(u128::from_be_bytes(bytes.try_into()?))
    }

    // ---- raw and length-prefixed sequences ---------------------------------------------

    /// Writes `bytes` verbatim, without a length prefix (used for handler signatures,
    ///  whose length is implied by the dispatch tree's depth).
    pub fn encode_raw(&mut self, bytes: &[u8]) {
        self.put(bytes);
    }

    pub fn decode_raw(&mut self, count: usize) -> anyhow::Result<Vec<u8>> {
        Ok(self.take(count)?.to_vec())
    }

    pub fn encode_bytes(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        if bytes.len() > u16::MAX as usize {
            bail!("byte array of length {} exceeds the u16 length prefix", bytes.len());
        }

        self.encode_u16(bytes.len() as u16);
        self.put(bytes);
        Ok(())
    }

    pub fn decode_bytes(&mut self) -> anyhow::Result<Vec<u8>> {
        let len = self.decode_u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn encode_str(&mut self, value: &str) -> anyhow::Result<()> {
        self.encode_bytes(value.as_bytes())
    }

    pub fn decode_str(&mut self) -> anyhow::Result<String> {
        let bytes = self.decode_bytes()?;
        Ok(String::from_utf8(bytes)?)
    }
}

impl Default for MessageEncoder {
    fn default() -> Self {
        MessageEncoder::new()
    }
}
