use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};

use super::traffic::{ByteCounter, TrafficRecorder};

/// Body wrapper that counts data frames as they are polled.
///
/// Optionally owns the request's [`TrafficRecorder`], so the traffic record
/// is published once the body is finished or dropped.
pub struct CountingBody<B> {
    inner: B,
    counter: ByteCounter,
    recorder: Option<TrafficRecorder>,
}

impl<B> CountingBody<B> {
    pub fn new(inner: B, counter: ByteCounter) -> Self {
        Self {
            inner,
            counter,
            recorder: None,
        }
    }

    /// Keep `recorder` alive until this body goes away.
    pub fn with_recorder(mut self, recorder: TrafficRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }
}

impl<B> Body for CountingBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.counter.add(data.len());
                }
            }
            Poll::Ready(None) => {
                // Publish as soon as the stream ends.
                this.recorder.take();
            }
            _ => {}
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

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};

    #[tokio::test]
    async fn counts_data_frames() {
        let counter = ByteCounter::default();
        let body = CountingBody::new(Full::new(Bytes::from_static(b"hello world")), counter.clone());
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.len(), 11);
        assert_eq!(counter.get(), 11);
    }
}
