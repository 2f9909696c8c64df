//! Live capture stream.
//!
//! A pump task reads the adapter's traffic tap, stamps every packet with a
//! sequence number and a decoded summary, and pushes it into a bounded
//! queue. A consumer that falls behind loses the oldest frames; every loss
//! is counted in [`CaptureStream::frames_dropped`].

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
   time::{Duration, Instant},
};

use bluer::Address;
use crossbeam::queue::ArrayQueue;
use futures::StreamExt;
use log::{debug, info, warn};
use smallvec::SmallVec;
use tokio::{sync::Notify, task::JoinHandle};

use crate::{
   bluetooth::{Direction, RawTraffic, Radio, TrafficKind, TrafficStream, adapter::Adapter, resubscribe},
   error::Result,
};

pub mod decode;

/// Payload bytes kept inline before spilling to the heap
pub type Payload = SmallVec<[u8; 64]>;

/// One observed packet. Immutable once produced.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
   pub seq: u64,
   pub timestamp: Instant,
   pub kind: TrafficKind,
   pub direction: Direction,
   pub source: Option<Address>,
   pub destination: Option<Address>,
   pub payload: Payload,
   pub summary: String,
}

impl CaptureFrame {
   fn new(seq: u64, raw: RawTraffic) -> Self {
      let summary = decode::summarize(raw.kind, &raw.payload);
      Self {
         seq,
         timestamp: Instant::now(),
         kind: raw.kind,
         direction: raw.kind.direction(),
         source: raw.source,
         destination: raw.destination,
         payload: SmallVec::from_vec(raw.payload),
         summary,
      }
   }
}

struct FrameQueue {
   frames: ArrayQueue<CaptureFrame>,
   notify: Notify,
   dropped: AtomicU64,
   closed: AtomicBool,
}

impl FrameQueue {
   fn push(&self, frame: CaptureFrame) {
      if let Some(evicted) = self.frames.force_push(frame) {
         self.dropped.fetch_add(1, Ordering::Relaxed);
         debug!("Capture queue full, dropped frame #{}", evicted.seq);
      }
      self.notify.notify_one();
   }

   fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }
}

/// Sequence of [`CaptureFrame`]s from one adapter.
///
/// Sequence numbers start at 1 on every [`CaptureStream::open`]. After
/// [`CaptureStream::close`] (or drop) no further frame is delivered, even
/// ones already queued.
pub struct CaptureStream {
   queue: Arc<FrameQueue>,
   pump: Option<JoinHandle<()>>,
   opened_at: Instant,
}

impl CaptureStream {
   /// Opens the traffic tap and starts the pump. `capacity` bounds how many
   /// frames may wait for the consumer.
   pub async fn open<R: Radio>(adapter: &Adapter<R>, capacity: usize) -> Result<Self> {
      let stream = adapter.radio().traffic(adapter.name()).await?;
      let queue = Arc::new(FrameQueue {
         frames: ArrayQueue::new(capacity.max(1)),
         notify: Notify::new(),
         dropped: AtomicU64::new(0),
         closed: AtomicBool::new(false),
      });
      info!("Capturing on {} (queue capacity {})", adapter.name(), capacity.max(1));

      let pump = Pump {
         adapter: adapter.clone(),
         queue: queue.clone(),
         seq: 0,
      };
      Ok(Self {
         queue,
         pump: Some(tokio::spawn(pump.run(stream))),
         opened_at: Instant::now(),
      })
   }

   /// Waits for the next frame; `None` once the stream is closed.
   pub async fn next(&mut self) -> Option<CaptureFrame> {
      loop {
         if self.queue.is_closed() {
            return None;
         }
         if let Some(frame) = self.queue.frames.pop() {
            return Some(frame);
         }
         self.queue.notify.notified().await;
      }
   }

   /// Frames evicted so far because the consumer fell behind.
   pub fn frames_dropped(&self) -> u64 {
      self.queue.dropped.load(Ordering::Relaxed)
   }

   /// Time from opening the stream to `frame`.
   pub fn elapsed(&self, frame: &CaptureFrame) -> Duration {
      frame.timestamp.saturating_duration_since(self.opened_at)
   }

   /// Stops the pump and discards anything still queued.
   pub fn close(&mut self) {
      if self.queue.closed.swap(true, Ordering::AcqRel) {
         return;
      }
      if let Some(pump) = self.pump.take() {
         pump.abort();
      }
      let mut discarded = 0usize;
      while self.queue.frames.pop().is_some() {
         discarded += 1;
      }
      self.queue.notify.notify_waiters();
      debug!("Capture closed, {discarded} queued frames discarded");
   }
}

impl Drop for CaptureStream {
   fn drop(&mut self) {
      self.close();
   }
}

struct Pump<R: Radio> {
   adapter: Adapter<R>,
   queue: Arc<FrameQueue>,
   seq: u64,
}

impl<R: Radio> Pump<R> {
   async fn run(mut self, mut stream: TrafficStream) {
      loop {
         while let Some(raw) = stream.next().await {
            if self.queue.is_closed() {
               return;
            }
            self.seq += 1;
            self.queue.push(CaptureFrame::new(self.seq, raw));
         }
         warn!("{}: Traffic tap lost", self.adapter.name());
         let what = format!("{} traffic", self.adapter.name());
         let adapter = &self.adapter;
         stream = resubscribe(&what, || adapter.radio().traffic(adapter.name())).await;
      }
   }
}
