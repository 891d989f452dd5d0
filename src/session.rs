// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Threads of a decode session.
//!
//! The interrupt entry point [`Session::isr`] only acknowledges the interrupt and forwards the
//! status code to the protocol thread through a single slot channel. The protocol thread owns the
//! [`H264Decoder`] and processes the status codes, the input and the drain requests one at a
//! time. Buffers returned by the consumer go through the [`Recycler`] thread before reaching the
//! protocol thread.

pub mod recycler;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use log::debug;
use log::error;
use log::warn;

use crate::backend::regs;
use crate::backend::Hardware;
use crate::decoder::h264::H264Decoder;
use crate::decoder::DecodeError;
use crate::decoder::DecodeState;
use crate::decoder::FrameSink;
use crate::decoder::Result;
use crate::session::recycler::RecycleQueue;
use crate::session::recycler::Recycler;

/// Options of a decode session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Output pictures as soon as they are decoded instead of in POC order.
    pub no_poc_reorder: bool,
    /// How long `submit_input` and `stop` wait for the decoder to become idle.
    pub idle_timeout: Duration,
    /// Period at which the core is polled for recycling readiness.
    pub recycle_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            no_poc_reorder: false,
            idle_timeout: Duration::from_millis(500),
            recycle_interval: Duration::from_millis(5),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Ready to take input.
    Idle,
    /// The firmware is working on the last input.
    Processing,
    /// A fatal error occurred. The session must be stopped.
    Aborted,
    Stopped,
}

impl From<DecodeState> for SessionState {
    fn from(state: DecodeState) -> Self {
        match state {
            DecodeState::Idle => SessionState::Idle,
            DecodeState::Processing => SessionState::Processing,
            DecodeState::Aborted => SessionState::Aborted,
        }
    }
}

enum ProtocolEvent {
    /// Status code read from the firmware by the interrupt handler.
    Irq(u32),
    Input(Bytes),
    /// Output all withheld pictures, then reply.
    Drain(mpsc::Sender<()>),
    Shutdown,
}

/// State shared by the session handle and the protocol thread.
struct Shared {
    state: Mutex<SessionState>,
    changed: Condvar,
    should_stop: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: SessionState) {
        let mut current = self.lock();
        // Stopped is final.
        if *current != SessionState::Stopped {
            *current = state;
        }
        self.changed.notify_all();
    }

    /// Waits at most `timeout` for the session to leave `Processing`.
    fn wait_not_processing(&self, timeout: Duration) -> MutexGuard<'_, SessionState> {
        let (state, _) = self
            .changed
            .wait_timeout_while(self.lock(), timeout, |state| {
                *state == SessionState::Processing
            })
            .unwrap_or_else(PoisonError::into_inner);

        state
    }
}

/// The protocol thread.
struct ProtocolWorker<H: Hardware, S: FrameSink> {
    decoder: H264Decoder<H, S>,
    events: mpsc::Receiver<ProtocolEvent>,
    returned: mpsc::Receiver<usize>,
    recycle_queue: Arc<RecycleQueue>,
    shared: Arc<Shared>,
    poll_interval: Duration,
}

impl<H: Hardware, S: FrameSink> ProtocolWorker<H, S> {
    fn run(mut self) -> H264Decoder<H, S> {
        debug!("Protocol thread started");

        while let Ok(event) = self.events.recv() {
            self.apply_returned_buffers();

            match event {
                ProtocolEvent::Irq(status) => self.handle_status(status),
                ProtocolEvent::Input(data) => match self.decoder.notify_input(&data) {
                    Ok(()) | Err(DecodeError::Aborted) => (),
                    Err(DecodeError::NotIdle) => warn!("Dropping input queued while processing"),
                    Err(err) => self.abort(&err),
                },
                ProtocolEvent::Drain(reply) => {
                    self.decoder.drain();
                    let _ = reply.send(());
                    continue;
                }
                ProtocolEvent::Shutdown => break,
            }

            self.shared.set(self.decoder.state().into());
        }

        debug!("Protocol thread stopped");
        self.decoder
    }

    fn abort(&mut self, err: &DecodeError) {
        self.recycle_queue.cancel();
        self.decoder.abort(err);
    }

    fn apply_returned_buffers(&mut self) {
        while let Ok(index) = self.returned.try_recv() {
            self.buffer_returned(index);
        }
    }

    fn buffer_returned(&mut self, index: usize) {
        if let Err(err) = self.decoder.buffer_returned(index) {
            self.abort(&err);
        }
    }

    /// Handles `status`, waiting for output buffers to be returned when the picture store is
    /// full.
    fn handle_status(&mut self, status: u32) {
        loop {
            match self.decoder.handle_status(status) {
                Ok(()) => return,
                Err(DecodeError::OutOfPictures) => {
                    if !self.wait_for_free_picture() {
                        return;
                    }
                }
                Err(err) => {
                    self.abort(&err);
                    return;
                }
            }
        }
    }

    /// Waits until the consumer returns a buffer. Returns `false` if the session is stopping or
    /// no buffer can ever come back.
    fn wait_for_free_picture(&mut self) -> bool {
        if !self.decoder.bump_one() && self.decoder.outstanding_buffers() == 0 {
            self.abort(&DecodeError::OutOfPictures);
            return false;
        }

        debug!("Picture store full, waiting for output buffers");

        loop {
            if self.shared.should_stop.load(Ordering::Acquire) {
                return false;
            }

            match self.returned.recv_timeout(self.poll_interval) {
                Ok(index) => {
                    self.buffer_returned(index);
                    self.apply_returned_buffers();
                    return self.decoder.state() != DecodeState::Aborted;
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Recycler gone while waiting for output buffers");
                    return false;
                }
            }
        }
    }
}

/// A running H.264 decode session.
pub struct Session<H: Hardware + 'static, S: FrameSink + 'static> {
    hw: Arc<H>,
    options: SessionOptions,
    shared: Arc<Shared>,
    events: mpsc::SyncSender<ProtocolEvent>,
    protocol: Option<JoinHandle<H264Decoder<H, S>>>,
    recycler: Recycler,
}

impl<H: Hardware + 'static, S: FrameSink + 'static> Session<H, S> {
    /// Starts the firmware and the session threads. Events are reported to `sink` from the
    /// protocol thread.
    pub fn new(hw: Arc<H>, sink: S, options: SessionOptions) -> Result<Self> {
        let decoder = H264Decoder::new(Arc::clone(&hw), sink, options.no_poc_reorder)?;

        let (returned_tx, returned_rx) = mpsc::channel();
        let recycler = Recycler::start(Arc::clone(&hw), returned_tx, options.recycle_interval)
            .map_err(|e| anyhow!(e))?;

        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Idle),
            changed: Condvar::new(),
            should_stop: AtomicBool::new(false),
        });

        let (events_tx, events_rx) = mpsc::sync_channel(1);
        let worker = ProtocolWorker {
            decoder,
            events: events_rx,
            returned: returned_rx,
            recycle_queue: Arc::clone(recycler.queue()),
            shared: Arc::clone(&shared),
            poll_interval: options.recycle_interval,
        };

        let protocol = thread::Builder::new()
            .name("amvdec-h264".into())
            .spawn(move || worker.run())
            .map_err(|e| anyhow!(e))?;

        Ok(Self {
            hw,
            options,
            shared,
            events: events_tx,
            protocol: Some(protocol),
            recycler,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.shared.lock()
    }

    /// Interrupt entry point. Blocks while the previous status is still queued.
    pub fn isr(&self) {
        self.hw.write_register(regs::ASSIST_MBOX1_CLR_REG, 0);
        let status = self.hw.read_status();

        if self.events.send(ProtocolEvent::Irq(status)).is_err() {
            debug!("Status {:#x} raised after the session stopped", status);
        }
    }

    /// Feeds compressed data to the decoder, waiting a bounded time for it to become idle.
    pub fn submit_input(&self, data: Bytes) -> Result<()> {
        let mut state = self.shared.wait_not_processing(self.options.idle_timeout);

        match *state {
            SessionState::Idle => *state = SessionState::Processing,
            SessionState::Processing => return Err(DecodeError::NotIdle),
            SessionState::Aborted | SessionState::Stopped => return Err(DecodeError::Aborted),
        }
        drop(state);

        self.events
            .send(ProtocolEvent::Input(data))
            .map_err(|_| DecodeError::Aborted)
    }

    /// Gives output buffer `index` back to the decoder.
    pub fn return_buffer(&self, index: usize) {
        if !self.recycler.queue().push(index) {
            warn!("Buffer {} returned to a stopped session", index);
        }
    }

    /// Outputs every withheld picture, for the end of the stream.
    pub fn drain(&self) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();

        self.events
            .send(ProtocolEvent::Drain(reply_tx))
            .map_err(|_| DecodeError::Aborted)?;

        reply_rx
            .recv_timeout(self.options.idle_timeout)
            .map_err(|_| DecodeError::Timeout)
    }

    /// Stops the threads, halts the firmware and frees its regions. Decoding in progress is
    /// abandoned and its buffer handed back with `frame_dropped`.
    pub fn stop(&mut self) {
        let protocol = match self.protocol.take() {
            Some(protocol) => protocol,
            None => return,
        };

        self.shared.should_stop.store(true, Ordering::Release);
        if *self.shared.wait_not_processing(self.options.idle_timeout) == SessionState::Processing
        {
            warn!("Firmware still decoding after {:?}, halting it", self.options.idle_timeout);
        }

        let _ = self.events.send(ProtocolEvent::Shutdown);
        let decoder = protocol.join();
        self.recycler.stop();

        match decoder {
            Ok(mut decoder) => decoder.teardown(),
            Err(_) => error!("Protocol thread panicked"),
        }

        self.shared.set(SessionState::Stopped);
        debug!("Session stopped");
    }
}

impl<H: Hardware + 'static, S: FrameSink + 'static> Drop for Session<H, S> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::backend::dummy::FakeHardware;
    use crate::codec::h264::rpm;
    use crate::codec::h264::rpm::RpmBuilder;
    use crate::codec::h264::rpm::SliceType;
    use crate::decoder::h264::Action;
    use crate::decoder::h264::Status;
    use crate::decoder::ReadyFrame;
    use crate::decoder::StreamInfo;

    /// 1280x720: 80 macroblocks wide, 3600 in total.
    const SEQ_INFO2_720P: u32 = 80 | (3600 << 8);

    #[derive(Default)]
    struct Events {
        formats: Vec<StreamInfo>,
        frames: Vec<ReadyFrame>,
        dropped: Vec<usize>,
        input_needed: usize,
        aborted: usize,
    }

    /// Records the session events where the test can see them.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Events>>);

    impl SharedSink {
        fn events(&self) -> MutexGuard<'_, Events> {
            self.0.lock().unwrap()
        }
    }

    impl FrameSink for SharedSink {
        fn format_changed(&mut self, info: &StreamInfo) {
            self.events().formats.push(info.clone());
        }

        fn frame_ready(&mut self, frame: ReadyFrame) {
            self.events().frames.push(frame);
        }

        fn frame_dropped(&mut self, index: usize) {
            self.events().dropped.push(index);
        }

        fn input_needed(&mut self) {
            self.events().input_needed += 1;
        }

        fn session_aborted(&mut self) {
            self.events().aborted += 1;
        }
    }

    type TestSession = Session<FakeHardware, SharedSink>;

    fn start(options: SessionOptions) -> (Arc<FakeHardware>, SharedSink, TestSession) {
        let _ = env_logger::try_init();
        let hw = Arc::new(FakeHardware::new());
        let sink = SharedSink::default();
        let session = Session::new(Arc::clone(&hw), sink.clone(), options).unwrap();
        (hw, sink, session)
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn load(hw: &FakeHardware, builder: &RpmBuilder) {
        let lmem = hw.register(regs::LMEM_DUMP_ADR);
        hw.fill_region(lmem, &builder.to_lmem());
    }

    /// Posts `status` and raises the interrupt.
    fn raise(hw: &FakeHardware, session: &TestSession, status: Status) {
        hw.set_register(regs::DPB_STATUS_REG, status as u32);
        session.isr();
    }

    fn wait_for_action(hw: &FakeHardware, action: Action) {
        wait_until("firmware action", || {
            hw.register(regs::DPB_STATUS_REG) == action as u32
        });
    }

    fn configure(hw: &FakeHardware, session: &TestSession) {
        hw.set_register(regs::AV_SCRATCH_1, SEQ_INFO2_720P);
        hw.set_register(regs::AV_SCRATCH_2, (1 << 15) | (1 << 13));
        hw.set_register(regs::AV_SCRATCH_B, 31 | (4 << 8));
        load(hw, &RpmBuilder::new());
        raise(hw, session, Status::ConfigRequest);
        wait_for_action(hw, Action::ConfigDone);
    }

    fn submit(hw: &FakeHardware, session: &TestSession) {
        session.submit_input(Bytes::from_static(&[0; 64])).unwrap();
        wait_for_action(hw, Action::SearchHead);
    }

    /// Runs one single slice picture through the firmware, which then runs out of input.
    fn decode_picture(
        hw: &FakeHardware,
        sink: &SharedSink,
        session: &TestSession,
        pic: &RpmBuilder,
    ) {
        load(hw, pic);
        raise(hw, session, Status::SliceHeadDone);
        wait_for_action(hw, Action::DecodeNewpic);

        let input_needed = sink.events().input_needed;
        hw.set_register(regs::VIFF_BIT_CNT, 0);
        raise(hw, session, Status::PicDataDone);
        wait_until("input request", || sink.events().input_needed > input_needed);
    }

    fn non_ref_frame(poc_lsb: u16) -> RpmBuilder {
        let mut builder = RpmBuilder::new();
        builder
            .nal(1, 0)
            .set(rpm::SLICE_TYPE, SliceType::P as u16)
            .set(rpm::PIC_ORDER_CNT_LSB, poc_lsb);
        builder
    }

    #[test]
    fn decode_and_recycle() {
        let (hw, sink, mut session) = start(Default::default());
        assert_eq!(session.state(), SessionState::Idle);

        configure(&hw, &session);
        assert_eq!(sink.events().formats.len(), 1);
        assert_eq!(sink.events().formats[0].num_buffers, 21);

        submit(&hw, &session);
        let mut idr = RpmBuilder::new();
        idr.nal(5, 3).set(rpm::SLICE_TYPE, SliceType::I as u16);
        decode_picture(&hw, &sink, &session, &idr);
        wait_until("idle session", || session.state() == SessionState::Idle);

        session.drain().unwrap();
        assert_eq!(
            sink.events().frames,
            vec![ReadyFrame {
                index: 0,
                pic_order_cnt: 0,
                keyframe: true
            }]
        );

        session.return_buffer(0);
        wait_until("recycled buffer", || hw.state().recycled == vec![0]);

        // Picked up by the protocol thread with the next event.
        session.drain().unwrap();

        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(hw.state().allocs, 4);
        assert_eq!(hw.state().frees, 4);
        assert_eq!(hw.live_regions(), 0);
        assert_eq!(sink.events().aborted, 0);
    }

    #[test]
    fn input_while_processing_is_refused() {
        let (hw, _sink, session) = start(SessionOptions {
            idle_timeout: Duration::from_millis(50),
            ..Default::default()
        });

        submit(&hw, &session);
        assert_eq!(session.state(), SessionState::Processing);

        assert!(matches!(
            session.submit_input(Bytes::from_static(&[1; 8])),
            Err(DecodeError::NotIdle)
        ));
        assert_eq!(hw.state().bitstream.len(), 64);

        // The firmware consumed the input.
        raise(&hw, &session, Status::SearchBufEmpty);
        wait_until("idle session", || session.state() == SessionState::Idle);
        session.submit_input(Bytes::from_static(&[1; 8])).unwrap();
        wait_until("queued input", || hw.state().bitstream.len() == 72);
    }

    #[test]
    fn unknown_status_aborts_session() {
        let (hw, sink, mut session) = start(Default::default());
        configure(&hw, &session);

        hw.set_register(regs::DPB_STATUS_REG, 0x99);
        session.isr();
        wait_until("aborted session", || session.state() == SessionState::Aborted);

        assert_eq!(sink.events().aborted, 1);
        assert_eq!(hw.live_regions(), 0);
        assert!(matches!(
            session.submit_input(Bytes::from_static(&[0; 8])),
            Err(DecodeError::Aborted)
        ));

        // Returns are dropped once aborted.
        session.return_buffer(0);
        thread::sleep(Duration::from_millis(20));
        assert!(hw.state().recycled.is_empty());

        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(hw.state().frees, 4);
        assert_eq!(sink.events().aborted, 1);
    }

    #[test]
    fn full_store_waits_for_returned_buffer() {
        let (hw, sink, mut session) = start(SessionOptions {
            no_poc_reorder: true,
            ..Default::default()
        });
        configure(&hw, &session);

        for n in 0..21 {
            decode_picture(&hw, &sink, &session, &non_ref_frame(2 * n));
        }
        assert_eq!(sink.events().frames.len(), 21);

        load(&hw, &non_ref_frame(42));
        raise(&hw, &session, Status::SliceHeadDone);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            hw.register(regs::DPB_STATUS_REG),
            Status::SliceHeadDone as u32
        );
        assert_eq!(hw.writes_to(regs::CURR_CANVAS_CTRL).len(), 21);

        session.return_buffer(5);
        wait_for_action(&hw, Action::DecodeNewpic);
        assert_eq!(hw.writes_to(regs::CURR_CANVAS_CTRL).last(), Some(&(5 << 24)));
        assert_eq!(hw.state().recycled, vec![5]);

        session.stop();
        assert_eq!(hw.live_regions(), 0);
        assert_eq!(sink.events().dropped, vec![5]);
        assert_eq!(sink.events().aborted, 0);
    }

    #[test]
    fn stop_halts_busy_firmware_before_freeing() {
        let (hw, sink, mut session) = start(SessionOptions {
            idle_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        configure(&hw, &session);
        submit(&hw, &session);
        assert_eq!(session.state(), SessionState::Processing);

        // The firmware never raises another interrupt.
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);

        let state = hw.state();
        assert!(!state.running);
        assert_eq!(state.halts, 1);
        assert_eq!(state.freed_while_running, 0);
        assert_eq!(state.frees, 4);
        drop(state);
        assert_eq!(hw.live_regions(), 0);
        assert_eq!(sink.events().aborted, 0);
    }

    #[test]
    fn stop_is_idempotent() {
        let (hw, sink, mut session) = start(Default::default());

        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(hw.state().frees, 3);

        assert!(matches!(
            session.submit_input(Bytes::from_static(&[0; 8])),
            Err(DecodeError::Aborted)
        ));
        assert!(matches!(session.drain(), Err(DecodeError::Aborted)));
        session.isr();

        drop(session);
        assert_eq!(hw.state().frees, 3);
        assert_eq!(sink.events().aborted, 0);
    }
}
