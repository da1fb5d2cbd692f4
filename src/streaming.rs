//! Cancellable fragment delivery on top of [`ProviderAdapter::stream`].
//!
//! [`StreamingCoordinator::open`] returns a [`FragmentStream`] owned by exactly one consumer.
//! Cancelling the [`CancelToken`] or dropping the stream drops the provider stream at once,
//! which closes the underlying connection; fragments already delivered stay with the caller.
//!
//! Adapters without native incremental delivery are emulated: the coordinator performs the
//! full call and yields a single fragment with `emulated = true` and `is_final = true`.
//! Native streams end with a synthetic empty fragment marked `is_final`.

use futures::stream::{BoxStream, Stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tracing::{debug, instrument};

use crate::error::{GenError, Result};
use crate::traits::{GenerateOptions, GenerateResponse, ProviderAdapter};

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

/// Shared cancellation flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every waiter.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            let wakers = std::mem::take(&mut *self.inner.wakers.lock());
            for waker in wakers {
                waker.wake();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn register(&self, waker: &Waker) {
        let mut wakers = self.inner.wakers.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        futures::future::poll_fn(|cx| {
            if self.is_cancelled() {
                return Poll::Ready(());
            }
            self.register(cx.waker());
            if self.is_cancelled() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

/// One delivered piece of output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFragment {
    /// Position among non-empty fragments, starting at 0.
    pub index: usize,
    pub text: String,
    /// Produced by emulation rather than native streaming.
    pub emulated: bool,
    /// Last fragment of the stream.
    pub is_final: bool,
}

enum Source {
    Native(BoxStream<'static, Result<String>>),
    Emulated(String),
}

/// Lazy, finite, single-consumer sequence of fragments.
pub struct FragmentStream {
    source: Option<Source>,
    token: CancelToken,
    index: usize,
    cancelled: bool,
    emulated_response: Option<GenerateResponse>,
}

impl FragmentStream {
    fn new(source: Source, token: CancelToken) -> Self {
        Self {
            source: Some(source),
            token,
            index: 0,
            cancelled: false,
            emulated_response: None,
        }
    }

    fn emulated(mut response: GenerateResponse, token: CancelToken) -> Self {
        response.emulated_stream = true;
        let mut stream = Self::new(Source::Emulated(response.content.clone()), token);
        stream.emulated_response = Some(response);
        stream
    }

    /// Full response behind an emulated stream, with `emulated_stream` set.
    pub fn emulated_response(&self) -> Option<&GenerateResponse> {
        self.emulated_response.as_ref()
    }

    /// Stop delivery and release the provider stream.
    pub fn cancel(&mut self) {
        if self.source.take().is_some() {
            self.cancelled = true;
        }
    }

    /// Whether delivery stopped because of cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether the provider stream is still held.
    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_emulated(&self) -> bool {
        self.emulated_response.is_some()
    }

    fn fragment(&mut self, text: String, emulated: bool, is_final: bool) -> StreamFragment {
        let fragment = StreamFragment {
            index: self.index,
            text,
            emulated,
            is_final,
        };
        self.index += 1;
        fragment
    }
}

impl Stream for FragmentStream {
    type Item = Result<StreamFragment>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.source.is_some() {
            this.token.register(cx.waker());
            if this.token.is_cancelled() {
                debug!("Stream cancelled, releasing provider stream");
                this.cancel();
            }
        }

        loop {
            match this.source.take() {
                None => return Poll::Ready(None),
                Some(Source::Emulated(text)) => {
                    return Poll::Ready(Some(Ok(this.fragment(text, true, true))));
                }
                Some(Source::Native(mut inner)) => match inner.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(text))) => {
                        this.source = Some(Source::Native(inner));
                        if text.is_empty() {
                            continue;
                        }
                        return Poll::Ready(Some(Ok(this.fragment(text, false, false))));
                    }
                    Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                    Poll::Ready(None) => {
                        return Poll::Ready(Some(Ok(this.fragment(String::new(), false, true))));
                    }
                    Poll::Pending => {
                        this.source = Some(Source::Native(inner));
                        return Poll::Pending;
                    }
                },
            }
        }
    }
}

/// Opens fragment streams over adapters.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingCoordinator;

impl StreamingCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Open a cancellable stream for `prompt`.
    ///
    /// Native streaming is used when the adapter offers it; otherwise the full call runs
    /// here (racing the token) and the result is delivered as one emulated fragment.
    #[instrument(skip_all, fields(provider = %adapter.provider_id(), model = %adapter.model()))]
    pub async fn open(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        prompt: &str,
        options: &GenerateOptions,
        token: &CancelToken,
    ) -> Result<FragmentStream> {
        if token.is_cancelled() {
            return Err(GenError::Cancelled);
        }

        if adapter.supports_streaming() {
            let opened = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(GenError::Cancelled),
                opened = adapter.stream(prompt, options) => opened,
            };
            match opened {
                Ok(inner) => return Ok(FragmentStream::new(Source::Native(inner), token.clone())),
                Err(GenError::NotSupported(reason)) => {
                    debug!(reason = %reason, "Falling back to emulated streaming");
                }
                Err(e) => return Err(e),
            }
        }

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(GenError::Cancelled),
            response = adapter.generate(prompt, options) => response?,
        };
        Ok(FragmentStream::emulated(response, token.clone()))
    }
}
