use std::io::BufReader;
use std::net::TcpStream;

use flounder_engine::QueryResult;
use flounder_error::{FlounderError, Result};

use crate::framing::{read_frame, write_frame, MAX_CLIENT_MESSAGE};

/// A connection to a Flounder server.
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Send one statement and wait for its result.
    pub fn send(&mut self, statement: &str) -> Result<QueryResult> {
        if statement.len() >= MAX_CLIENT_MESSAGE {
            return Err(FlounderError::MessageTooLarge {
                size: statement.len(),
                limit: MAX_CLIENT_MESSAGE,
            });
        }
        write_frame(&mut self.writer, statement.as_bytes())?;
        let payload = read_frame(&mut self.reader, None)?
            .ok_or_else(|| FlounderError::internal("server closed the connection"))?;
        serde_json::from_slice(&payload)
            .map_err(|e| FlounderError::internal(format!("malformed server response: {e}")))
    }
}
