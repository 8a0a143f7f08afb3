//! NBD connection pool.
//!
//! One [`Client`] serves one request at a time, so callers that want
//! parallel I/O hold several connections. The pool dials lazily up to its
//! cap and reuses idle connections; a connection that saw an error is
//! dropped instead of returned.

use std::sync::Mutex;

use tokio::sync::{Semaphore, SemaphorePermit};

use imageio_proto::{Error, ImageResult};

use crate::client::Client;
use crate::url::NbdUrl;

pub struct Pool {
    url: NbdUrl,
    dirty: bool,
    sem: Semaphore,
    idle: Mutex<Vec<Client>>,
}

impl Pool {
    /// Create a pool around an already negotiated first connection. The
    /// probe's negotiation results (size, flags, contexts) apply to every
    /// connection the pool dials later.
    pub fn new(url: NbdUrl, dirty: bool, max_connections: u32, probe: Client) -> Pool {
        Pool {
            url,
            dirty,
            sem: Semaphore::new(max_connections.max(1) as usize),
            idle: Mutex::new(vec![probe]),
        }
    }

    pub async fn acquire(&self) -> ImageResult<PooledClient<'_>> {
        let permit = self
            .sem
            .acquire()
            .await
            .map_err(|_| Error::Internal("NBD pool is closed".into()))?;
        let idle_client = self.idle.lock().unwrap().pop();
        let client = match idle_client {
            Some(client) => client,
            None => Client::connect(&self.url, self.dirty).await?,
        };
        Ok(PooledClient {
            pool: self,
            client: Some(client),
            _permit: permit,
        })
    }

    /// Stop handing out connections and disconnect the idle ones.
    pub async fn close(&self) {
        self.sem.close();
        let clients: Vec<Client> = std::mem::take(&mut *self.idle.lock().unwrap());
        for client in clients {
            let _ = client.disconnect().await;
        }
    }
}

/// Guard for a pooled connection. Return it with [`PooledClient::put_back`]
/// after a clean operation; dropping the guard discards the connection,
/// which is the right move after an error of unknown protocol depth.
pub struct PooledClient<'a> {
    pool: &'a Pool,
    client: Option<Client>,
    _permit: SemaphorePermit<'a>,
}

impl PooledClient<'_> {
    pub fn client(&mut self) -> &mut Client {
        self.client.as_mut().unwrap()
    }

    pub fn put_back(mut self) {
        if let Some(client) = self.client.take() {
            self.pool.idle.lock().unwrap().push(client);
        }
    }
}
