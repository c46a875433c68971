use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::fs::OpenFile;

/// The machine's console device: one byte-stream in, one byte-stream out.
///
/// The kernel opens it once per direction and hands the resulting files to
/// every process as descriptors 0 and 1; the shared locks behind the handles
/// are what make the console "synchronized". Backed by arbitrary reader and
/// writer so tests can feed and capture bytes.
#[derive(Clone)]
pub struct Console {
    input: Arc<Mutex<dyn Read + Send>>,
    output: Arc<Mutex<dyn Write + Send>>,
}

impl Console {
    pub fn new(input: impl Read + Send + 'static, output: impl Write + Send + 'static) -> Self {
        Self {
            input: Arc::new(Mutex::new(input)),
            output: Arc::new(Mutex::new(output)),
        }
    }

    /// Console wired to the host's stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(io::stdin(), io::stdout())
    }

    /// A read-only handle on the console input.
    pub fn open_for_reading(&self) -> Box<dyn OpenFile> {
        Box::new(ConsoleFile {
            input: Some(Arc::clone(&self.input)),
            output: None,
        })
    }

    /// A write-only handle on the console output.
    pub fn open_for_writing(&self) -> Box<dyn OpenFile> {
        Box::new(ConsoleFile {
            input: None,
            output: Some(Arc::clone(&self.output)),
        })
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Console")
    }
}

struct ConsoleFile {
    input: Option<Arc<Mutex<dyn Read + Send>>>,
    output: Option<Arc<Mutex<dyn Write + Send>>>,
}

impl OpenFile for ConsoleFile {
    fn name(&self) -> &str {
        "console"
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.input {
            Some(input) => input.lock().unwrap().read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "console handle is write-only",
            )),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.output {
            Some(output) => {
                let mut out = output.lock().unwrap();
                let n = out.write(buf)?;
                out.flush()?;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "console handle is read-only",
            )),
        }
    }

    /// The console has no positions; seeks are accepted and ignored.
    fn seek(&mut self, _pos: u64) -> io::Result<()> {
        Ok(())
    }
}
