use bytes::Bytes;
use pingora::{Error, ErrorType};

/// Accumulates a request body until the stream ends so the whole payload
/// can be classified at once.
pub struct BodyInspector {
    pub max_body_size: usize,
    buffer: Vec<u8>,
}

impl BodyInspector {
    pub fn new(max_body_size: usize) -> Self {
        Self {
            max_body_size,
            buffer: Vec::new(),
        }
    }

    pub fn append_chunk(&mut self, chunk: &Bytes) -> Result<(), Box<Error>> {
        if self.buffer.len() + chunk.len() > self.max_body_size {
            return Err(Error::explain(
                ErrorType::Custom("BodySizeLimitExceeded"),
                format!(
                    "Request body exceeds maximum size of {} bytes",
                    self.max_body_size
                ),
            ));
        }

        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    pub fn body(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
