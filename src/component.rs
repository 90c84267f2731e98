//! Defines the Component trait, used to run a blocking piece of work on its
//! own thread and talk to it through channels. The device link is the one
//! component in VibroTrial: every byte that goes to the hardware is written
//! from a worker thread, so a stalled device can hold up that worker but never
//! the thread that sequences stages.

use log::{debug, info, warn};
use std::fmt;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::device::{Device, DeviceLink};
use crate::protocol::Command;
use crate::transport::{Endpoint, TransportError};

/// Errors a component can report while shutting down.
#[derive(Debug)]
pub enum ComponentError {
    /// The device could not be silenced on the way out.
    Transport(TransportError),
}

impl From<TransportError> for ComponentError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

///
/// A unit of work that runs on its own thread. It consumes inputs one at a
/// time from a channel and answers each with one output.
///
pub trait Component: ToString {
    /// What the component consumes.
    type InData;
    /// What the component produces for each input.
    type OutData;

    /// Converts an input of type A into an output of type B
    fn convert(&mut self, input: Self::InData) -> Self::OutData;

    /// Cleans up once the input channel closes
    fn finalize(&mut self) -> Result<(), ComponentError>;
}

/// Runs the given Component on its own thread. On receiving data of type
/// InData on the input channel, the Component converts them to data of type
/// OutData and sends it to the output channel.
pub fn run_component<C: Component + Send + 'static>(
    mut component: Box<C>,
    input: Receiver<<C as Component>::InData>,
    output: Sender<<C as Component>::OutData>,
) -> JoinHandle<()>
where
    <C as Component>::InData: Send + 'static,
    <C as Component>::OutData: Send + 'static,
{
    thread::spawn(move || {
        while let Ok(data) = input.recv() {
            let out_data = component.convert(data);
            if let Err(error) = output.send(out_data) {
                warn!("{} : received error {}.", component.to_string(), error);
            }
        }

        if let Err(component_error) = component.finalize() {
            warn!(
                "{} : error during terminating : {component_error:?}.",
                component.to_string(),
            );
        }
        info!("{} : terminated.", component.to_string());
    })
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Device({})", DeviceLink::endpoint(self))
    }
}

impl Component for Device {
    type InData = (u64, Command);
    type OutData = (u64, Result<(), TransportError>);

    fn convert(&mut self, (seq, command): Self::InData) -> Self::OutData {
        (seq, self.execute(command))
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        let stopped = if DeviceLink::endpoint(self) == Endpoint::Null {
            Ok(())
        } else {
            self.stop()
        };
        self.close();
        stopped.map_err(ComponentError::from)
    }
}

/// Handle on a [Device] running on its own thread.
///
/// [DeviceLink::send] waits at most the reply timeout for the worker. A late
/// reply is discarded when it finally arrives, so replies never get matched
/// to the wrong request.
pub struct DeviceWorker {
    requests: Sender<(u64, Command)>,
    replies: Receiver<(u64, Result<(), TransportError>)>,
    next_seq: u64,
    timeout: Duration,
    endpoint: Endpoint,
    _handle: JoinHandle<()>,
}

impl DeviceWorker {
    /// Moves `device` onto a new worker thread.
    pub fn spawn(device: Device, timeout: Duration) -> Self {
        let endpoint = DeviceLink::endpoint(&device);
        let (requests, worker_rx) = channel();
        let (worker_tx, replies) = channel();
        let handle = run_component(Box::new(device), worker_rx, worker_tx);
        debug!("device worker started for {endpoint}");

        DeviceWorker {
            requests,
            replies,
            next_seq: 0,
            timeout,
            endpoint,
            _handle: handle,
        }
    }
}

impl DeviceLink for DeviceWorker {
    fn send(&mut self, command: Command) -> Result<(), TransportError> {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.requests
            .send((seq, command))
            .map_err(|_| TransportError::WorkerGone)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok((reply_seq, result)) if reply_seq == seq => return result,
                Ok((stale, _)) => debug!("discarding late reply to request {stale}"),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("{} : no reply within {:?}", self.endpoint, self.timeout);
                    return Err(TransportError::Timeout);
                }
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::WorkerGone),
            }
        }
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceProfile;
    use crate::protocol::Opcode;
    use crate::transport::mock::MockTransport;

    /// Null MockComponent for compilation testing
    struct MockComponent {}

    impl Component for MockComponent {
        type InData = i32;
        type OutData = i32;

        fn convert(&mut self, input: i32) -> i32 {
            input + 1
        }

        fn finalize(&mut self) -> Result<(), ComponentError> {
            Ok(())
        }
    }

    impl ToString for MockComponent {
        fn to_string(&self) -> String {
            "MockComponent".to_string()
        }
    }

    #[test]
    fn test_chained_component() {
        let (test_tx, block_a_rx) = channel::<i32>();
        let (block_a_tx, block_b_rx) = channel::<i32>();
        let (block_b_tx, test_rx) = channel::<i32>();

        run_component(Box::new(MockComponent {}), block_a_rx, block_a_tx);
        run_component(Box::new(MockComponent {}), block_b_rx, block_b_tx);

        assert_eq!(test_tx.send(0), Ok(()));
        assert_eq!(test_rx.recv(), Ok(2));
    }

    fn worker(timeout: Duration) -> (DeviceWorker, MockTransport) {
        let mock = MockTransport::new();
        let device = Device::new(Box::new(mock.clone()), DeviceProfile::default());
        (DeviceWorker::spawn(device, timeout), mock)
    }

    #[test]
    fn worker_forwards_commands_and_errors() {
        let (mut worker, mock) = worker(Duration::from_secs(2));

        worker.send(Command::Ping).unwrap();
        mock.fail_opcode(Opcode::Ping, 1);
        assert!(matches!(
            worker.send(Command::Ping),
            Err(TransportError::Write(_))
        ));
        worker.send(Command::Calibrate).unwrap();

        assert_eq!(mock.commands(), vec![Command::Ping, Command::Calibrate]);
    }

    #[test]
    fn stalled_device_times_out_and_late_reply_is_dropped() {
        let (mut worker, mock) = worker(Duration::from_millis(50));

        mock.stall_for(Some(Duration::from_millis(200)));
        assert!(matches!(
            worker.send(Command::Ping),
            Err(TransportError::Timeout)
        ));
        mock.stall_for(None);

        // let the stalled write finish so its reply is queued
        thread::sleep(Duration::from_millis(400));

        worker.send(Command::Calibrate).unwrap();
        assert_eq!(mock.commands(), vec![Command::Ping, Command::Calibrate]);
    }

    #[test]
    fn dropped_handle_stops_the_worker() {
        let (worker, mock) = worker(Duration::from_secs(1));
        drop(worker);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(mock.commands(), vec![Command::Stop]);
    }
}
