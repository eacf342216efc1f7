/*!
    byte-stream boundary between the engine and whatever carries the bus.

    The engine only needs a bidirectional byte channel with a stable identity
    string: the [SerialChannel] backend covers real usb-serial bridges, the
    [mock::MockChannel] replaces the whole module chain with a scripted
    responder for tests.
*/

use std::{
    future::Future,
    io,
    path::Path,
    pin::Pin,
    };
use serial2_tokio::{SerialPort, CharSize, StopBits, Parity};


/// a bidirectional byte stream able to carry the bus
pub trait Channel: Send + Sync + 'static {
    /// stable identity of the underlying endpoint, eg. the serial number of
    /// the usb bridge or the port path
    fn identity(&self) -> &str;

    /// read up to `buf.len()` bytes, returning how many arrived; 0 means the
    /// channel is gone for good
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a;

    /// write the whole buffer or fail
    fn write<'a>(&'a self, bytes: &'a [u8]) -> impl Future<Output = io::Result<()>> + Send + 'a;
}


/// shared handles carry the bus just as well, tests keep one end to script with
impl<C: Channel> Channel for std::sync::Arc<C> {
    fn identity(&self) -> &str {
        (**self).identity()
    }
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        (**self).read(buf)
    }
    fn write<'a>(&'a self, bytes: &'a [u8]) -> impl Future<Output = io::Result<()>> + Send + 'a {
        (**self).write(bytes)
    }
}


pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// object-safe twin of [Channel] so the engine can store any backend
pub(crate) trait DynChannel: Send + Sync {
    fn identity(&self) -> &str;
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>>;
    fn write<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;
}

impl<C: Channel> DynChannel for C {
    fn identity(&self) -> &str {
        Channel::identity(self)
    }
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(Channel::read(self, buf))
    }
    fn write<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(Channel::write(self, bytes))
    }
}

/// fill the whole buffer, treating a 0 read as a dead channel
pub(crate) async fn read_exact(channel: &dyn DynChannel, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let count = channel.read(&mut buf[filled ..]).await?;
        if count == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "bus channel closed"));
        }
        filled += count;
    }
    Ok(())
}


/// usb-serial backend, the production channel
pub struct SerialChannel {
    port: SerialPort,
    identity: String,
}

impl SerialChannel {
    /// open the serial device at the given path with the given baud rate, 8N1 raw
    pub fn open(path: impl AsRef<Path>, rate: u32) -> io::Result<Self> {
        let port = SerialPort::open(path.as_ref(), |mut settings: serial2_tokio::Settings| {
                settings.set_raw();
                settings.set_baud_rate(rate)?;
                settings.set_char_size(CharSize::Bits8);
                settings.set_stop_bits(StopBits::One);
                settings.set_parity(Parity::None);
                Ok(settings)
                })?;
        Ok(Self {
            port,
            identity: path.as_ref().display().to_string(),
        })
    }
}

impl Channel for SerialChannel {
    fn identity(&self) -> &str {
        &self.identity
    }
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        self.port.read(buf)
    }
    fn write<'a>(&'a self, bytes: &'a [u8]) -> impl Future<Output = io::Result<()>> + Send + 'a {
        self.port.write_all(bytes)
    }
}


pub mod mock {
    /*!
        in-memory channel standing in for a whole module chain.

        A scripted responder closure is invoked for every datagram the engine
        writes and returns the raw reply packets of the fake modules. Tests can
        also inject arbitrary bytes (garbage included) into the read side.
    */

    use std::{
        io,
        sync::Mutex,
        sync::atomic::{AtomicBool, Ordering},
        future::Future,
        };
    use tokio::sync::mpsc;


    /// invoked with every packet the engine writes; returns the raw packets
    /// the fake module chain sends back, in order
    pub type FrameHandler = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

    pub struct MockChannel {
        identity: String,
        handler: Mutex<Option<FrameHandler>>,
        written: Mutex<Vec<Vec<u8>>>,
        failing: AtomicBool,
        incoming_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
        incoming: tokio::sync::Mutex<Incoming>,
    }

    struct Incoming {
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl MockChannel {
        pub fn new(handler: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) -> Self {
            let mut new = Self::silent();
            *new.handler.get_mut().unwrap() = Some(Box::new(handler));
            new
        }

        /// a channel whose fake modules never answer anything
        pub fn silent() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                identity: "mock".into(),
                handler: Mutex::new(None),
                written: Mutex::new(Vec::new()),
                failing: AtomicBool::new(false),
                incoming_tx: Mutex::new(Some(tx)),
                incoming: tokio::sync::Mutex::new(Incoming { rx, pending: Vec::new() }),
            }
        }

        /// push raw bytes into the read side, as if a module had sent them
        pub fn inject(&self, bytes: Vec<u8>) {
            if let Some(tx) = self.incoming_tx.lock().unwrap().as_ref() {
                let _ = tx.send(bytes);
            }
        }

        /// every packet the engine wrote so far, oldest first
        pub fn written(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }

        /// simulate the usb bridge disappearing: pending injected bytes still
        /// drain, then reads report a dead channel
        pub fn unplug(&self) {
            self.incoming_tx.lock().unwrap().take();
        }

        /// make every write fail from now on
        pub fn fail_writes(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    impl super::Channel for MockChannel {
        fn identity(&self) -> &str {
            &self.identity
        }

        fn read<'a>(&'a self, buf: &'a mut [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a {
            async move {
                let mut incoming = self.incoming.lock().await;
                if incoming.pending.is_empty() {
                    match incoming.rx.recv().await {
                        Some(bytes) => incoming.pending = bytes,
                        None => return Ok(0),
                    }
                }
                let count = buf.len().min(incoming.pending.len());
                buf[.. count].copy_from_slice(&incoming.pending[.. count]);
                incoming.pending.drain(.. count);
                Ok(count)
            }
        }

        fn write<'a>(&'a self, bytes: &'a [u8]) -> impl Future<Output = io::Result<()>> + Send + 'a {
            async move {
                if self.failing.load(Ordering::SeqCst) {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
                }
                self.written.lock().unwrap().push(bytes.to_vec());
                let replies = match self.handler.lock().unwrap().as_mut() {
                    Some(handler) => handler(bytes),
                    None => Vec::new(),
                };
                for reply in replies {
                    self.inject(reply);
                }
                Ok(())
            }
        }
    }
}
