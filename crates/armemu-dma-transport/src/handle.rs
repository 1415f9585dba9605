//! Host-side channel handles.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::queue::FullPolicy;
use crate::transport::Shared;

/// The reference-counted part of a [`ChannelHandle`]; its drop is the host detach.
pub(crate) struct HandleInner {
    shared: Arc<Shared>,
    index: u32,
}

impl HandleInner {
    pub(crate) fn new(shared: Arc<Shared>, index: u32) -> Self {
        Self { shared, index }
    }
}

impl fmt::Debug for HandleInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleInner")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        tracing::debug!(index = self.index, "last host handle dropped");
        self.shared.release_desktop(self.index);
    }
}

/// Host endpoint of one channel.
///
/// Cloning is cheap and every clone talks to the same channel. The host side stays attached
/// until the last clone is dropped.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    inner: Arc<HandleInner>,
}

impl ChannelHandle {
    pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Self {
        Self { inner }
    }

    pub fn index(&self) -> u32 {
        self.inner.index
    }

    /// Number of live clones of this handle.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Queue `packet` for the guest, dropping the oldest queued packet if the queue is full.
    pub fn send(&self, packet: &[u8]) -> Result<()> {
        self.send_with(packet, FullPolicy::DropOldest)
    }

    pub fn send_with(&self, packet: &[u8], policy: FullPolicy) -> Result<()> {
        self.inner.shared.send(self.inner.index, packet, policy)
    }

    /// Wait up to `timeout` for a packet from the guest.
    ///
    /// Returns the number of bytes copied into `buf`, or `Ok(0)` if nothing arrived in time.
    /// Packets longer than `buf` are truncated.
    pub fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.inner.shared.receive(self.inner.index, buf, timeout)
    }

    /// Like [`Self::receive`], but waits on the transport's dispatcher and hands the packet to
    /// `callback`. An empty packet means the wait timed out.
    pub fn receive_async(
        &self,
        timeout: Duration,
        callback: impl FnOnce(Result<Vec<u8>>) + Send + 'static,
    ) {
        let handle = self.clone();
        let packet_size = self.inner.shared.config.packet_size as usize;
        self.inner.shared.dispatcher().schedule(Box::new(move || {
            let mut buf = vec![0u8; packet_size];
            let result = handle.receive(&mut buf, timeout).map(|len| {
                buf.truncate(len);
                buf
            });
            callback(result);
        }));
    }
}
