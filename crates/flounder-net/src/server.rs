use std::io::BufReader;
use std::net::{TcpListener, TcpStream};

use flounder_engine::{execute_statement, DbConfig};
use flounder_error::Result;
use flounder_storage::Database;

use crate::framing::{read_frame, write_frame, MAX_CLIENT_MESSAGE};

fn handle_client(stream: TcpStream, db: &mut Database, config: &mut DbConfig) -> Result<()> {
    let peer = stream.peer_addr()?;
    tracing::info!(%peer, "client connected");
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    while let Some(payload) = read_frame(&mut reader, Some(MAX_CLIENT_MESSAGE))? {
        let statement = String::from_utf8_lossy(&payload).into_owned();
        tracing::debug!(%statement, "statement received");
        let result = execute_statement(&statement, db, config);
        let encoded = serde_json::to_vec(&result)
            .map_err(|e| flounder_error::FlounderError::internal(e.to_string()))?;
        write_frame(&mut writer, &encoded)?;
    }
    tracing::info!(%peer, "client disconnected");
    Ok(())
}

/// Run the server loop on `port`, sharing one database across clients.
/// Clients are served sequentially as they connect.
pub fn serve(port: u16, db: &mut Database, config: &mut DbConfig) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    tracing::info!(port, "listening");
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = handle_client(stream, db, config) {
                    tracing::warn!(%e, "client session ended with error");
                }
            }
            Err(e) => tracing::warn!(%e, "accept failed"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Client;
    use flounder_engine::QueryResult;

    #[test]
    fn client_server_roundtrip() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let mut db = Database::new();
            let mut config = DbConfig::default();
            let (stream, _) = listener.accept().unwrap();
            handle_client(stream, &mut db, &mut config).unwrap();
        });

        let mut client = Client::connect("127.0.0.1", port).unwrap();
        let result: QueryResult = client.send("CREATE TABLE t (a BIGINT)").unwrap();
        assert!(!result.error, "{}", result.error_message);
        let result: QueryResult = client.send("tables").unwrap();
        assert!(result.render().contains('t'));
        drop(client);
        handle.join().unwrap();
    }
}
