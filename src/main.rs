use std::mem::MaybeUninit;
use std::net::{AddrParseError, IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::getuid;

use tthttpd::auth::IpPattern;
use tthttpd::config::{DEFAULT_INDEX_NAMES, DEFAULT_TIMEOUT};
use tthttpd::mime::DEFAULT_MIME_TYPE;
use tthttpd::{LogSink, Server, ServerConfig, ServerConfigBuilder, ServerStats};

const COPYRIGHT: &str = "copyright (c) 2021 Tom Dryer";
const MAIN_LOOP_INTERVAL: Duration = Duration::from_millis(100);

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

fn main() -> Result<()> {
    println!(
        "{}/{}, {}.",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        COPYRIGHT,
    );

    let options = Options::from_command_line()?;
    let socket_addr = options.socket_addr().context("malformed --addr argument")?;
    let log_to_stdout = matches!(options.log_sink, LogSink::Stdout);
    let config = options
        .builder
        .logger(Arc::new(options.log_sink))
        .build()?;
    if config.verbosity >= 1 {
        eprintln!("serving {}", config.root.display());
    }

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    let mut server = Server::start(Arc::new(config), socket_addr)?;
    println!("listening on: http://{}/", server.local_addr());

    // main loop
    while is_running() {
        sleep(MAIN_LOOP_INTERVAL);
    }
    server.stop();
    server.wait();

    // Only print usage stats if the request log isn't going to stdout.
    if !log_to_stdout {
        print_stats(server.stats())?;
    }
    Ok(())
}

/// Command line settings.
struct Options {
    builder: ServerConfigBuilder,
    bindaddr: Option<String>,
    bindport: u16,
    log_sink: LogSink,
}

impl Options {
    fn from_command_line() -> Result<Self> {
        // TODO: use std::env::args_os to allow non-UTF-8 filenames
        let mut args = std::env::args();
        let name = args.next().unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        let bindport = if getuid().is_root() { 80 } else { 8080 };
        let wwwroot = match args.next() {
            None => {
                usage(&name, bindport); // no wwwroot given
                std::process::exit(0);
            }
            Some(arg) if arg == "--help" => {
                usage(&name, bindport);
                std::process::exit(0);
            }
            Some(wwwroot) => wwwroot,
        };
        let mut options = Self {
            builder: ServerConfig::builder(&wwwroot),
            bindaddr: None,
            bindport,
            log_sink: LogSink::Stdout,
        };
        let mut verbosity = 0u8;
        while let Some(arg) = args.next() {
            let builder = options.builder;
            options.builder = match arg.as_str() {
                "--port" => {
                    let number = args.next().context("missing number after --port")?;
                    options.bindport = number
                        .parse()
                        .with_context(|| format!("port number {} is invalid", number))?;
                    builder
                }
                "--addr" => {
                    options.bindaddr = Some(args.next().context("missing ip after --addr")?);
                    builder
                }
                "--maxconn" => {
                    let number = args.next().context("missing number after --maxconn")?;
                    builder.max_connections(Some(
                        number
                            .parse()
                            .with_context(|| format!("maxconn number {} is invalid", number))?,
                    ))
                }
                "--log" => {
                    let filename = args.next().context("missing filename after --log")?;
                    options.log_sink = LogSink::file(Path::new(&filename))?;
                    builder
                }
                "--syslog" => {
                    options.log_sink = LogSink::Syslog;
                    builder
                }
                "--index" => {
                    let filename = args.next().context("missing filename after --index")?;
                    builder.default_page(&filename)
                }
                "--no-listing" => builder.listing(false),
                "--mimetypes" => {
                    let filename = args.next().context("missing filename after --mimetypes")?;
                    let mut builder = builder;
                    builder
                        .mime_map_mut()
                        .parse_extension_map_file(Path::new(&filename))?;
                    builder
                }
                "--default-mimetype" => {
                    let mimetype = args
                        .next()
                        .context("missing string after --default-mimetype")?;
                    let mut builder = builder;
                    builder.mime_map_mut().set_default_mimetype(&mimetype);
                    builder
                }
                "--no-server-id" => builder.server_id(false),
                "--timeout" => {
                    let number = args.next().context("missing number after --timeout")?;
                    let timeout_secs = number
                        .parse::<u64>()
                        .with_context(|| format!("timeout number {} is invalid", number))?;
                    builder.timeout(match timeout_secs {
                        0 => None,
                        timeout_secs => Some(Duration::from_secs(timeout_secs)),
                    })
                }
                "--auth" => {
                    let user_pass = args.next().context("missing user:pass after --auth")?;
                    builder.credential_pair(&user_pass)?
                }
                "--accept" => {
                    let prefix = args.next().context("missing prefix after --accept")?;
                    let users = args.next().context("missing users after --accept")?;
                    let users: Vec<&str> = users.split(',').filter(|u| !u.is_empty()).collect();
                    if users.is_empty() {
                        return Err(anyhow!("expected at least one user after --accept"));
                    }
                    builder.accept(&prefix, users.as_slice())
                }
                "--allow-ip" => {
                    let pattern = args.next().context("missing pattern after --allow-ip")?;
                    builder.allow_ip(IpPattern::from_str(&pattern)?)
                }
                "--alias" => {
                    let from = args.next().context("missing prefix after --alias")?;
                    let to = args.next().context("missing target after --alias")?;
                    builder.alias(&from, &to)
                }
                "--env" => {
                    let key_value = args.next().context("missing KEY=VALUE after --env")?;
                    builder.env_pair(&key_value)?
                }
                "-v" | "--verbose" => {
                    verbosity = verbosity.saturating_add(1);
                    builder.verbosity(verbosity)
                }
                _ => {
                    return Err(anyhow!("unknown argument `{}'", arg));
                }
            };
        }
        Ok(options)
    }

    fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let addr = match self.bindaddr.as_deref() {
            Some(addr) => IpAddr::from_str(addr)?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        Ok(SocketAddr::new(addr, self.bindport))
    }
}

fn usage(argv0: &str, bindport: u16) {
    print!(
        "usage:\t{} /path/to/wwwroot [flags]\n\n\
        flags:\t--port number (default: {}, or 80 if running as root)\n\
        \t\tSpecifies which port to listen on for connections.\n\
        \t\tPass 0 to let the system choose any free port for you.\n\n\
        \t--addr ip (default: all)\n\
        \t\tIf multiple interfaces are present, specifies\n\
        \t\twhich one to bind the listening port to.\n\n\
        \t--maxconn number (default: unlimited)\n\
        \t\tSpecifies how many concurrent connections to accept.\n\n\
        \t--log filename (default: stdout)\n\
        \t\tSpecifies which file to append the request log to.\n\n\
        \t--syslog\n\
        \t\tUse syslog for request log.\n\n\
        \t--index filename (default: {})\n\
        \t\tDefault file to serve when a directory is requested.\n\
        \t\tMay be given several times; names are tried in order.\n\n\
        \t--no-listing\n\
        \t\tDo not serve listing if directory is requested.\n\n\
        \t--mimetypes filename (optional)\n\
        \t\tParses specified file for extension-MIME associations.\n\n\
        \t--default-mimetype string (optional, default: {})\n\
        \t\tFiles with unknown extensions are served as this mimetype.\n\n\
        \t--no-server-id\n\
        \t\tDon't identify the server type in headers\n\
        \t\tor directory listings.\n\n\
        \t--timeout secs (default: {})\n\
        \t\tIf a connection is idle for more than this many seconds,\n\
        \t\tit will be closed. Set to zero to disable timeouts.\n\n\
        \t--auth username:password\n\
        \t\tEnable basic authentication. May be given several times.\n\n\
        \t--accept prefix user[,user...]\n\
        \t\tOnly the listed users may access paths under prefix.\n\n\
        \t--allow-ip pattern\n\
        \t\tOnly accept clients matching pattern (*, an address,\n\
        \t\tor address/prefix-length). May be given several times.\n\n\
        \t--alias prefix target\n\
        \t\tServe requests under prefix from target, relative to wwwroot.\n\n\
        \t--env KEY=VALUE\n\
        \t\tAdd a variable to the CGI environment of every request.\n\n\
        \t-v, --verbose\n\
        \t\tPrint request resolution details. Repeat for more.\n\n",
        argv0,
        bindport,
        DEFAULT_INDEX_NAMES.join(", "),
        DEFAULT_MIME_TYPE,
        DEFAULT_TIMEOUT.as_secs(),
    );
}

fn print_stats(stats: &ServerStats) -> Result<()> {
    let rusage = getrusage().context("failed to get resource usage")?;
    println!(
        "CPU time used: {}.{:02} user, {}.{:02} system",
        rusage.ru_utime.tv_sec,
        rusage.ru_utime.tv_usec / 10000,
        rusage.ru_stime.tv_sec,
        rusage.ru_stime.tv_usec / 10000,
    );
    println!("Requests: {}", stats.num_requests.load(Ordering::Relaxed));
    println!(
        "Bytes: {} in, {} out",
        stats.total_in.load(Ordering::Relaxed),
        stats.total_out.load(Ordering::Relaxed)
    );
    Ok(())
}

/// Safe wrapper for `libc::getrusage`.
fn getrusage() -> std::io::Result<libc::rusage> {
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr()) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { rusage.assume_init() })
}
