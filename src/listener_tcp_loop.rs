//! TCP accept loop of the DICOM listener, restartable by the control
//! surface.
use crate::scp::{handle_association, StoreDispatcher};
use crate::thread_pool::ThreadPool;
use dicom::ul::association::server::AcceptAny;
use dicom::ul::ServerAssociationOptions;
use std::net::{SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// The DICOM listener. `start` binds the port and serves associations on a
/// pool of OS threads; `stop` releases the port after draining the
/// associations already being handled.
pub struct DicomListener {
    address: SocketAddrV4,
    options: Arc<ServerAssociationOptions<'static, AcceptAny>>,
    n_threads: usize,
    max_pdu_length: usize,
    dispatcher: StoreDispatcher,
    /// Only used by tests: exit by itself after this many associations.
    finite_connections: Option<usize>,
    running: Mutex<Option<RunningListener>>,
}

struct RunningListener {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<anyhow::Result<()>>,
}

impl DicomListener {
    pub(crate) fn new(
        address: SocketAddrV4,
        options: ServerAssociationOptions<'static, AcceptAny>,
        n_threads: usize,
        max_pdu_length: usize,
        dispatcher: StoreDispatcher,
        finite_connections: Option<usize>,
    ) -> Self {
        Self {
            address,
            options: Arc::new(options),
            n_threads,
            max_pdu_length,
            dispatcher,
            finite_connections,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Bind the port and start accepting associations.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut running = self.running.lock().unwrap();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            anyhow::bail!("the DICOM listener is already running");
        }
        let listener = TcpListener::bind(self.address)?;
        tracing::info!("listening on: tcp://{}", self.address);
        let stop = Arc::new(AtomicBool::new(false));
        let loop_args = (
            Arc::clone(&self.options),
            self.n_threads,
            self.max_pdu_length,
            self.dispatcher.clone(),
            self.finite_connections,
            Arc::clone(&stop),
        );
        let handle = thread::Builder::new()
            .name("dicom_listener".to_string())
            .spawn(move || {
                let (options, n_threads, max_pdu_length, dispatcher, finite, stop) = loop_args;
                accept_loop(listener, options, n_threads, max_pdu_length, dispatcher, finite, stop)
            })?;
        *running = Some(RunningListener { stop, handle });
        Ok(())
    }

    /// Release the port. Associations already accepted run to completion.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().unwrap().take() else {
            return;
        };
        running.stop.store(true, Ordering::SeqCst);
        // unblock the accept call
        let _ = TcpStream::connect(self.address);
        match running.handle.join() {
            Ok(Ok(())) => tracing::info!("DICOM listener stopped"),
            Ok(Err(e)) => tracing::error!("DICOM listener exited with an error: {e:?}"),
            Err(_) => tracing::error!("DICOM listener thread panicked"),
        }
    }

    /// Release the port and bind it again.
    pub fn restart(&self) -> anyhow::Result<()> {
        self.stop();
        self.start()
    }
}

/// Serve incoming associations until stopped.
///
/// Every TCP connection is handled by [handle_association] on one of
/// `n_threads` workers, which push received DICOM instances through the
/// `dispatcher`.
fn accept_loop(
    listener: TcpListener,
    options: Arc<ServerAssociationOptions<'static, AcceptAny>>,
    n_threads: usize,
    max_pdu_length: usize,
    dispatcher: StoreDispatcher,
    finite_connections: Option<usize>,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut pool = ThreadPool::new(n_threads, "dicom_listener");
    let dispatcher = Arc::new(dispatcher);
    let incoming: Box<dyn Iterator<Item = Result<TcpStream, _>>> =
        if let Some(n) = finite_connections {
            Box::new(listener.incoming().take(n))
        } else {
            Box::new(listener.incoming())
        };
    for stream in incoming {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(scu_stream) => {
                let options = Arc::clone(&options);
                let dispatcher = Arc::clone(&dispatcher);
                pool.execute(move || {
                    let ulid = ulid::Ulid::new();
                    if let Err(e) =
                        handle_association(scu_stream, &options, max_pdu_length, &dispatcher, ulid)
                    {
                        tracing::error!(association_ulid = ulid.to_string(), "{:?}", e);
                    }
                });
            }
            Err(e) => tracing::error!("failed to accept connection: {e}"),
        }
    }
    pool.shutdown();
    Ok(())
}
