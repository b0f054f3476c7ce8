//! Spins up a throwaway `postgres` backend for integration tests that
//! need to exercise the proxy against something that actually speaks
//! the wire protocol, rather than an in-memory double.
//!
//! The backend link is always cleartext with no native Postgres
//! authentication, so the backend is always started with `trust`
//! authentication; there is no auth-method knob to plumb through.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

pub const STARTUP_TIMEOUT_DURATION: Duration = Duration::from_secs(30);
pub const PORT_RELEASE_TIMEOUT: Duration = Duration::from_secs(30);
pub const LINGER_DURATION: Duration = Duration::from_secs(1);
pub const HOT_LOOP_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_USERNAME: &str = "username";
pub const DEFAULT_DATABASE: &str = "postgres";

#[derive(Debug, Clone, Default)]
pub enum PostgresBinPath {
    #[default]
    Path,
    Specified(PathBuf),
}

/// Where the backend listens. The proxy's own upstream-selection logic
/// (`pgproxy_core::connect_backend`) picks Unix vs TCP by checking
/// whether the configured string names an existing path, so tests that
/// want to exercise that branch ask for `enable_unix()`.
#[derive(Debug, Clone)]
pub enum ListenAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl ListenAddress {
    /// The string a `pgproxy_core::SessionConfig::upstream` field would
    /// be set to, to reach this backend.
    pub fn as_upstream_string(&self) -> String {
        match self {
            ListenAddress::Tcp(addr) => addr.to_string(),
            ListenAddress::Unix(path) => path.display().to_string(),
        }
    }
}

#[derive(Debug)]
pub struct PostgresBuilder {
    bin_path: PostgresBinPath,
    data_dir: Option<PathBuf>,
    server_options: HashMap<String, String>,
    unix_enabled: bool,
}

impl Default for PostgresBuilder {
    fn default() -> Self {
        Self {
            bin_path: PostgresBinPath::default(),
            data_dir: None,
            server_options: HashMap::new(),
            unix_enabled: false,
        }
    }
}

impl PostgresBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to locate the `initdb`/`postgres` binaries relative to
    /// this crate's manifest, falling back to `$PATH`. Returns an error
    /// if neither is found, so callers can skip the test rather than fail it.
    pub fn with_automatic_bin_path(mut self) -> std::io::Result<Self> {
        let bindir = postgres_bin_dir()?;
        self.bin_path = PostgresBinPath::Specified(bindir);
        Ok(self)
    }

    pub fn bin_path(mut self, bin_path: impl AsRef<Path>) -> Self {
        self.bin_path = PostgresBinPath::Specified(bin_path.as_ref().to_path_buf());
        self
    }

    pub fn data_dir(mut self, data_dir: PathBuf) -> Self {
        self.data_dir = Some(data_dir);
        self
    }

    pub fn server_option(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.server_options
            .insert(key.as_ref().to_string(), value.as_ref().to_string());
        self
    }

    pub fn enable_unix(mut self) -> Self {
        self.unix_enabled = true;
        self
    }

    pub fn build(self) -> std::io::Result<PostgresProcess> {
        let initdb = match &self.bin_path {
            PostgresBinPath::Path => "initdb".into(),
            PostgresBinPath::Specified(path) => path.join("initdb"),
        };
        let postgres = match &self.bin_path {
            PostgresBinPath::Path => "postgres".into(),
            PostgresBinPath::Specified(path) => path.join("postgres"),
        };

        if !initdb.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("initdb executable not found at {}", initdb.display()),
            ));
        }
        if !postgres.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("postgres executable not found at {}", postgres.display()),
            ));
        }

        let temp_dir = TempDir::new()?;
        let port = EphemeralPort::allocate()?;
        let data_dir = self
            .data_dir
            .unwrap_or_else(|| temp_dir.path().join("data"));

        init_postgres(&initdb, &data_dir)?;
        let port = port.take();

        let (socket_address, socket_path) = if self.unix_enabled {
            (
                ListenAddress::Unix(get_unix_socket_path(&data_dir, port)),
                Some(&data_dir),
            )
        } else {
            (
                ListenAddress::Tcp(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)),
                None,
            )
        };

        let mut command = Command::new(postgres);
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg("-D")
            .arg(&data_dir)
            .arg("-h")
            .arg(Ipv4Addr::LOCALHOST.to_string())
            .arg("-F")
            .arg("-p")
            .arg(port.to_string());

        if let Some(socket_path) = &socket_path {
            command.arg("-k").arg(socket_path);
        }

        for (key, value) in self.server_options {
            command.arg("-c").arg(format!("{}={}", key, value));
        }

        let child = run_postgres(command, socket_path, port)?;

        Ok(PostgresProcess {
            child,
            socket_address,
            tcp_address: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port),
            temp_dir,
        })
    }
}

/// Represents an ephemeral port that can be allocated and released for
/// immediate re-use by another process.
struct EphemeralPort {
    port: u16,
    listener: Option<TcpListener>,
}

impl EphemeralPort {
    fn allocate() -> std::io::Result<Self> {
        let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
        socket.set_linger(Some(LINGER_DURATION))?;
        socket.bind(&std::net::SocketAddr::from((Ipv4Addr::LOCALHOST, 0)).into())?;
        socket.listen(1)?;
        let listener = TcpListener::from(socket);
        let port = listener.local_addr()?.port();
        Ok(EphemeralPort {
            port,
            listener: Some(listener),
        })
    }

    /// Consumes the `EphemeralPort`, releasing the listening socket and
    /// waiting for the kernel to actually free the port before handing
    /// it back.
    fn take(self) -> u16 {
        drop(self.listener);

        let start = Instant::now();
        while start.elapsed() < PORT_RELEASE_TIMEOUT {
            let res = std::net::TcpStream::connect((Ipv4Addr::LOCALHOST, self.port));
            if res.is_err() {
                break;
            }
            std::thread::sleep(HOT_LOOP_INTERVAL);
        }

        self.port
    }
}

struct StdioReader {
    output: Arc<RwLock<String>>,
}

impl StdioReader {
    fn spawn<R: BufRead + Send + 'static>(reader: R, prefix: &'static str) -> Self {
        let output = Arc::new(RwLock::new(String::new()));
        let output_clone = Arc::clone(&output);

        thread::spawn(move || {
            let mut buf_reader = std::io::BufReader::new(reader);
            loop {
                let mut line = String::new();
                match buf_reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if let Ok(mut output) = output_clone.write() {
                            output.push_str(&line);
                        }
                        eprint!("[{}]: {}", prefix, line);
                    }
                    Err(e) => {
                        if let Ok(mut output) = output_clone.write() {
                            output.push_str(&format!("error reading {}: {}\n", prefix, e));
                        }
                        break;
                    }
                }
            }
        });

        StdioReader { output }
    }

    fn contains(&self, s: &str) -> bool {
        self.output.read().map(|o| o.contains(s)).unwrap_or(false)
    }
}

fn init_postgres(initdb: &Path, data_dir: &Path) -> std::io::Result<()> {
    let mut command = Command::new(initdb);
    command
        .arg("-D")
        .arg(data_dir)
        .arg("-A")
        .arg("trust")
        .arg("-U")
        .arg(DEFAULT_USERNAME);

    let output = command.output()?;
    if !output.status.success() {
        eprintln!(
            "initdb stderr:\n{}",
            String::from_utf8_lossy(&output.stderr)
        );
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "initdb command failed",
        ));
    }
    Ok(())
}

fn run_postgres(
    mut command: Command,
    socket_path: Option<impl AsRef<Path>>,
    port: u16,
) -> std::io::Result<std::process::Child> {
    let socket_path = socket_path.map(|path| path.as_ref().to_owned());

    let mut child = command.spawn()?;

    let stdout_reader = BufReader::new(child.stdout.take().expect("captured stdout"));
    let _ = StdioReader::spawn(stdout_reader, "stdout");
    let stderr_reader = BufReader::new(child.stderr.take().expect("captured stderr"));
    let stderr_reader = StdioReader::spawn(stderr_reader, "stderr");

    let start_time = Instant::now();
    let mut tcp_socket: Option<std::net::TcpStream> = None;
    let mut unix_socket: Option<std::os::unix::net::UnixStream> = None;
    let unix_socket_path = socket_path.map(|path| get_unix_socket_path(path, port));
    let tcp_socket_addr = std::net::SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    let mut db_ready = false;
    let mut network_ready = false;

    while start_time.elapsed() < STARTUP_TIMEOUT_DURATION && !network_ready {
        std::thread::sleep(HOT_LOOP_INTERVAL);
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("postgres exited with status: {}", status),
                ))
            }
            Err(e) => return Err(e),
            _ => {}
        }
        if !db_ready && stderr_reader.contains("database system is ready to accept connections") {
            db_ready = true;
        } else {
            continue;
        }
        if let Some(unix_socket_path) = &unix_socket_path {
            if unix_socket.is_none() {
                unix_socket = std::os::unix::net::UnixStream::connect(unix_socket_path).ok();
            }
        }
        if tcp_socket.is_none() {
            tcp_socket = std::net::TcpStream::connect(tcp_socket_addr).ok();
        }
        network_ready =
            (unix_socket_path.is_none() || unix_socket.is_some()) && tcp_socket.is_some();
    }

    if network_ready {
        return Ok(child);
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "postgres failed to start within 30 seconds",
    ))
}

fn postgres_bin_dir() -> std::io::Result<PathBuf> {
    let cargo_path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../build/postgres/install/bin");
    if cargo_path.exists() {
        cargo_path.canonicalize()
    } else {
        Path::new("../../build/postgres/install/bin").canonicalize()
    }
}

fn get_unix_socket_path(socket_path: impl AsRef<Path>, port: u16) -> PathBuf {
    socket_path.as_ref().join(format!(".s.PGSQL.{}", port))
}

pub struct PostgresProcess {
    child: std::process::Child,
    pub socket_address: ListenAddress,
    pub tcp_address: SocketAddr,
    #[allow(unused)]
    temp_dir: TempDir,
}

impl Drop for PostgresProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

/// Creates and runs a new Postgres server process in a temporary
/// directory. Returns `Ok(None)` rather than an error when the
/// `postgres`/`initdb` binaries can't be found, so tests can skip
/// instead of fail on machines without a local Postgres install.
pub fn setup_postgres(unix: bool) -> std::io::Result<Option<PostgresProcess>> {
    let Ok(builder) = PostgresBuilder::new().with_automatic_bin_path() else {
        eprintln!("skipping test: postgres bin dir not found");
        return Ok(None);
    };
    let builder = if unix {
        builder.enable_unix()
    } else {
        builder
    };
    Ok(Some(builder.build()?))
}
