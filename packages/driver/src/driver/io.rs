use futures::channel::mpsc;
use futures::executor::block_on;
use futures::SinkExt;
use std::time::Duration;
use zwh_core::prelude::*;
use zwh_serial::binding::SerialBinding;
use zwh_serial::error::{Error as SerialError, Result as SerialResult};
use zwh_serial::frame::{RawSerialFrame, SerialFramer};

/// Spacing between attempts to re-open the serial port
const REOPEN_SPACING: Duration = Duration::from_secs(1);
/// How long to idle when neither reads nor writes are pending
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Pumps bytes between the serial binding and the driver's frame channels.
/// Blocking; meant to run on its own thread:
///
/// ```ignore
/// std::thread::spawn(move || run_serial_io(binding, adapter.serial_in, adapter.serial_out, 10));
/// ```
///
/// A disconnect triggers re-open attempts with one second spacing. The pump
/// ends when the driver closes its channels or the port cannot be re-opened.
pub fn run_serial_io(
    mut binding: impl SerialBinding,
    mut serial_in: mpsc::Sender<RawSerialFrame>,
    mut serial_out: mpsc::Receiver<RawSerialFrame>,
    open_attempts: u8,
) -> SerialResult<()> {
    binding.open()?;

    let mut framer = SerialFramer::new();
    let mut buf = [0u8; 256];

    loop {
        // Drain pending writes first, so ACKs go out before we read more
        let mut wrote = false;
        loop {
            match serial_out.try_next() {
                Ok(Some(frame)) => {
                    binding.write(&frame.as_bytes())?;
                    wrote = true;
                }
                // The driver is gone
                Ok(None) => {
                    let _ = binding.close();
                    return Ok(());
                }
                Err(_) => break,
            }
        }

        match binding.read(&mut buf) {
            Ok(0) => {
                if !wrote {
                    std::thread::sleep(IDLE_SLEEP);
                }
            }
            Ok(n) => {
                for frame in framer.push_bytes(&buf[..n]) {
                    if block_on(serial_in.send(frame)).is_err() {
                        let _ = binding.close();
                        return Ok(());
                    }
                }
            }
            Err(SerialError::PortClosed) => {
                reopen(&mut binding, open_attempts)?;
                framer = SerialFramer::new();
            }
            Err(e) => return Err(e),
        }
    }
}

fn reopen(binding: &mut impl SerialBinding, attempts: u8) -> SerialResult<()> {
    let mut last_error = SerialError::PortClosed;
    for _ in 0..attempts.max(1) {
        std::thread::sleep(REOPEN_SPACING);
        match binding.open() {
            Ok(()) => return Ok(()),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::StreamExt;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use zwh_core::hex_literal;

    /// A scripted binding: yields queued reads, records writes, and can
    /// simulate a disconnect
    #[derive(Clone, Default)]
    struct MockBinding {
        inner: Arc<Mutex<MockBindingState>>,
    }

    #[derive(Default)]
    struct MockBindingState {
        reads: VecDeque<Vec<u8>>,
        writes: Vec<Vec<u8>>,
        opens: usize,
        fail_next_read: bool,
    }

    impl SerialBinding for MockBinding {
        fn open(&mut self) -> SerialResult<()> {
            self.inner.lock().unwrap().opens += 1;
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> SerialResult<()> {
            self.inner.lock().unwrap().writes.push(data.to_vec());
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> SerialResult<usize> {
            let mut state = self.inner.lock().unwrap();
            if state.fail_next_read {
                state.fail_next_read = false;
                return Err(SerialError::PortClosed);
            }
            match state.reads.pop_front() {
                Some(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                None => Ok(0),
            }
        }

        fn close(&mut self) -> SerialResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_frames_flow_both_ways() {
        let binding = MockBinding::default();
        binding
            .inner
            .lock()
            .unwrap()
            .reads
            .push_back(hex_literal!("01030008f406"));

        let (serial_in_tx, mut serial_in_rx) = mpsc::channel(16);
        let (mut serial_out_tx, serial_out_rx) = mpsc::channel(16);

        // Queue an outgoing ACK, then close the driver side so the pump ends
        block_on(serial_out_tx.send(RawSerialFrame::ControlFlow(
            zwh_serial::frame::ControlFlow::ACK,
        )))
        .unwrap();

        let pump_binding = binding.clone();
        let handle = std::thread::spawn(move || {
            run_serial_io(pump_binding, serial_in_tx, serial_out_rx, 1)
        });

        // The inbound bytes become frames
        let frame = block_on(serial_in_rx.next()).unwrap();
        assert!(matches!(frame, RawSerialFrame::Data(_)));
        let frame = block_on(serial_in_rx.next()).unwrap();
        assert!(matches!(
            frame,
            RawSerialFrame::ControlFlow(zwh_serial::frame::ControlFlow::ACK)
        ));

        drop(serial_out_tx);
        handle.join().unwrap().unwrap();

        let state = binding.inner.lock().unwrap();
        assert_eq!(state.writes, vec![vec![0x06u8]]);
        assert_eq!(state.opens, 1);
    }

    #[test]
    fn test_reopen_after_disconnect() {
        let binding = MockBinding::default();
        binding.inner.lock().unwrap().fail_next_read = true;

        let (serial_in_tx, _serial_in_rx) = mpsc::channel(16);
        let (serial_out_tx, serial_out_rx) = mpsc::channel::<RawSerialFrame>(16);

        let pump_binding = binding.clone();
        let handle = std::thread::spawn(move || {
            run_serial_io(pump_binding, serial_in_tx, serial_out_rx, 2)
        });

        // Give the pump time to hit the failed read and re-open
        std::thread::sleep(Duration::from_millis(1200));
        drop(serial_out_tx);
        handle.join().unwrap().unwrap();

        // Initial open plus the successful re-open
        assert!(binding.inner.lock().unwrap().opens >= 2);
    }
}
