use std::io::{self, Read, Write};

use log::{debug, trace};

use super::{
    CHECKSUM_LEN, MAX_BODY_LEN, Payload, ProtocolError, REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN, Request,
    Response, Section, request::verify,
};

/// Exchanges protocol messages over a byte stream, one message at a time.
///
/// The client side uses [`write_request`](Self::write_request) and
/// [`read_response`](Self::read_response); the appliance side of the same framing is
/// available through [`read_request`](Self::read_request) and
/// [`write_response`](Self::write_response).
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    verify_checksums: bool,
    max_body_len: u64,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            verify_checksums: true,
            max_body_len: MAX_BODY_LEN,
        }
    }

    /// Turns response checksum verification on or off.
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Largest body a peer may declare; anything above fails before allocation.
    pub fn max_body_len(mut self, max: u64) -> Self {
        self.max_body_len = max;
        self
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    /// Reads exactly `n` bytes, looping over short reads.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Closed`] if the peer closes the stream first.
    pub fn receive_exact(&mut self, n: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![0; n];
        let mut received = 0;
        while received < n {
            match self.stream.read(&mut buf[received..]) {
                Ok(0) => {
                    return Err(ProtocolError::Closed {
                        expected: n,
                        received,
                    });
                }
                Ok(read) => received += read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        trace!("received {n} bytes");
        Ok(buf)
    }

    pub fn write_request(&mut self, request: &Request) -> Result<(), ProtocolError> {
        let bytes = request.encode()?;
        trace!("writing {} request bytes", bytes.len());
        self.stream.write_all(&bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Reads one response.
    ///
    /// A non-success status fails with [`ProtocolError::Appliance`] right after the header;
    /// no body bytes are consumed in that case.
    pub fn read_response(&mut self) -> Result<Response, ProtocolError> {
        let header = self.receive_exact(RESPONSE_HEADER_LEN)?;
        let mut response = Response::decode_header(&header, self.verify_checksums)?;
        debug!(
            "response {} status {} body {} bytes",
            response.command, response.status, response.body_length
        );

        if !response.status.is_success() {
            return Err(ProtocolError::Appliance {
                command: response.command,
                status: response.status,
            });
        }

        if response.body_length > 0 {
            let len = body_len(response.body_length, self.max_body_len)?;
            let body = self.receive_exact(len)?;
            let trailer = self.receive_exact(CHECKSUM_LEN)?;
            response.attach_body(body, &trailer, self.verify_checksums)?;
        }
        Ok(response)
    }

    /// Writes `request` and waits for its response.
    pub fn send_request(&mut self, request: &Request) -> Result<Response, ProtocolError> {
        self.write_request(request)?;
        self.read_response()
    }

    /// Reads one request, checking both checksums. The body comes back as raw bytes.
    pub fn read_request(&mut self) -> Result<Request, ProtocolError> {
        let header = self.receive_exact(REQUEST_HEADER_LEN)?;
        let mut request = Request::decode_header(&header)?;

        if request.body_length > 0 {
            let len = body_len(request.body_length, self.max_body_len)?;
            let body = self.receive_exact(len)?;
            let trailer = self.receive_exact(CHECKSUM_LEN)?;
            verify(Section::Body, &body, &trailer)?;
            request.body = Some(Payload::RawBytes(body));
        }
        Ok(request)
    }

    pub fn write_response(&mut self, response: &Response) -> Result<(), ProtocolError> {
        let bytes = response.encode()?;
        self.stream.write_all(&bytes)?;
        self.stream.flush()?;
        Ok(())
    }
}

fn body_len(body_length: u64, max: u64) -> Result<usize, ProtocolError> {
    if body_length > max {
        return Err(ProtocolError::BodyTooLarge {
            len: body_length,
            max,
        });
    }
    usize::try_from(body_length).map_err(|_| ProtocolError::BodyTooLarge {
        len: body_length,
        max: usize::MAX as u64,
    })
}
