//! Body wrappers that observe frames as they stream through.
//!
//! Neither wrapper buffers or alters the stream: frames are forwarded as
//! they arrive and only a bounded prefix is copied aside.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use axum_core::body::Body;
use bytes::Bytes;
use http_body::{Body as _, Frame, SizeHint};

use super::capture::PendingEntry;

/// Bounded copy of a body prefix plus the true total size.
///
/// A body that was never read to the end reports the larger of the bytes seen
/// and the declared length.
#[derive(Debug, Clone, Default)]
pub(crate) struct BodyRecorder {
    limit: usize,
    captured: Vec<u8>,
    seen: u64,
    declared: Option<u64>,
    finished: bool,
}

impl BodyRecorder {
    pub(crate) const fn new(limit: usize) -> Self {
        Self {
            limit,
            captured: Vec::new(),
            seen: 0,
            declared: None,
            finished: false,
        }
    }

    /// Length announced up front by `Content-Length` or an exact size hint.
    pub(crate) const fn with_declared(mut self, declared: Option<u64>) -> Self {
        self.declared = declared;
        self
    }

    pub(crate) fn record(&mut self, chunk: &[u8]) {
        self.seen += chunk.len() as u64;
        let room = self.limit.saturating_sub(self.captured.len());
        if room > 0 {
            self.captured
                .extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    pub(crate) const fn finish(&mut self) {
        self.finished = true;
    }

    const fn has_room(&self) -> bool {
        self.captured.len() < self.limit
    }

    pub(crate) fn captured(&self) -> &[u8] {
        &self.captured
    }

    pub(crate) fn total(&self) -> u64 {
        match self.declared {
            Some(declared) if !self.finished => self.seen.max(declared),
            _ => self.seen,
        }
    }
}

/// Request body that copies a prefix into a shared recorder.
///
/// The recorder is shared because the request body moves downstream while
/// the capture layer still needs its contents when the response finishes.
pub(crate) struct TeeBody {
    inner: Body,
    recorder: Arc<Mutex<BodyRecorder>>,
}

impl TeeBody {
    pub(crate) const fn new(inner: Body, recorder: Arc<Mutex<BodyRecorder>>) -> Self {
        Self { inner, recorder }
    }
}

impl http_body::Body for TeeBody {
    type Data = Bytes;
    type Error = axum_core::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                let mut recorder = this.recorder.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(data) = frame.data_ref() {
                    recorder.record(data);
                }
                if this.inner.is_end_stream() {
                    recorder.finish();
                }
            }
            Poll::Ready(None) => this
                .recorder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .finish(),
            Poll::Ready(Some(Err(_))) | Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Handlers may drop the request without reading it. Whatever is already
/// available is copied up to the ceiling; nothing waits on the network.
impl Drop for TeeBody {
    fn drop(&mut self) {
        let mut recorder = self.recorder.lock().unwrap_or_else(PoisonError::into_inner);
        if recorder.finished {
            return;
        }
        let mut cx = Context::from_waker(Waker::noop());
        while recorder.has_room() {
            match Pin::new(&mut self.inner).poll_frame(&mut cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if let Some(data) = frame.data_ref() {
                        recorder.record(data);
                    }
                }
                Poll::Ready(None) => {
                    recorder.finish();
                    return;
                }
                Poll::Ready(Some(Err(_))) | Poll::Pending => break,
            }
        }
        if self.inner.is_end_stream() {
            recorder.finish();
        }
    }
}

/// Response body that records a prefix and completes the pending log entry
/// when the stream ends, fails, or is dropped.
pub(crate) struct CaptureBody {
    inner: Body,
    pending: Option<PendingEntry>,
}

impl CaptureBody {
    pub(crate) const fn new(inner: Body, pending: PendingEntry) -> Self {
        Self {
            inner,
            pending: Some(pending),
        }
    }
}

impl http_body::Body for CaptureBody {
    type Data = Bytes;
    type Error = axum_core::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(pending)) = (frame.data_ref(), this.pending.as_mut()) {
                    pending.record_response(data);
                }
                if this.inner.is_end_stream() {
                    drop(this.pending.take());
                }
            }
            Poll::Ready(Some(Err(_)) | None) => drop(this.pending.take()),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
