//! Serial console proxy.
//!
//! Connects to a VM's console Unix socket and forwards raw bytes both
//! ways with the host terminal in raw mode. Ctrl-] (ASCII 29) detaches.
//! Terminal state is restored on every exit path, signals included.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tracing::debug;

const DETACH_CHAR: u8 = 29; // Ctrl-]

/// Saved terminal state for restoration from the signal handler.
static ORIG_TERMIOS: Mutex<Option<(i32, libc::termios)>> = Mutex::new(None);
static SIGNAL_HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

fn install_signal_handlers() {
    if SIGNAL_HANDLERS_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    extern "C" fn signal_handler(sig: libc::c_int) {
        if let Ok(guard) = ORIG_TERMIOS.lock() {
            if let Some((fd, termios)) = *guard {
                unsafe {
                    libc::tcsetattr(fd, libc::TCSANOW, &termios);
                }
            }
        }
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
    }

    unsafe {
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGHUP, signal_handler as libc::sighandler_t);
    }
}

fn setup_raw_terminal(stdin_fd: i32) -> Result<libc::termios> {
    if unsafe { libc::isatty(stdin_fd) } != 1 {
        bail!("console requires a terminal");
    }

    install_signal_handlers();

    let mut termios: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(stdin_fd, &mut termios) } != 0 {
        bail!("failed to get terminal attributes");
    }
    let orig = termios;

    if let Ok(mut guard) = ORIG_TERMIOS.lock() {
        *guard = Some((stdin_fd, orig));
    }

    unsafe {
        libc::cfmakeraw(&mut termios);
    }
    if unsafe { libc::tcsetattr(stdin_fd, libc::TCSANOW, &termios) } != 0 {
        if let Ok(mut guard) = ORIG_TERMIOS.lock() {
            *guard = None;
        }
        bail!("failed to set raw terminal mode");
    }

    Ok(orig)
}

fn restore_terminal(stdin_fd: i32, termios: libc::termios) {
    unsafe {
        libc::tcsetattr(stdin_fd, libc::TCSANOW, &termios);
    }
    if let Ok(mut guard) = ORIG_TERMIOS.lock() {
        *guard = None;
    }
}

/// Attach the current terminal to the console socket until the detach
/// byte arrives or the VM side closes.
pub fn attach(vm_name: &str, socket_path: &Path) -> Result<()> {
    if !socket_path.exists() {
        bail!(
            "console socket not found: {} (VM may still be starting)",
            socket_path.display()
        );
    }

    let stream = UnixStream::connect(socket_path)
        .with_context(|| format!("failed to connect to console socket: {}", socket_path.display()))?;
    debug!(socket = %socket_path.display(), "console connected");

    println!("Connected to VM console: {vm_name}");
    println!("Press Ctrl+] to detach\n");

    let stdin_fd = std::io::stdin().as_raw_fd();
    let orig = setup_raw_terminal(stdin_fd)?;

    let done = Arc::new(AtomicBool::new(false));

    // Reader thread: socket -> stdout.
    let mut read_stream = stream.try_clone().context("cloning console stream")?;
    let reader_done = done.clone();
    let reader = std::thread::spawn(move || {
        let mut stdout = std::io::stdout();
        let mut buf = [0u8; 4096];
        loop {
            if reader_done.load(Ordering::Relaxed) {
                break;
            }
            match read_stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout.write_all(&buf[..n]).is_err() {
                        break;
                    }
                    let _ = stdout.flush();
                }
            }
        }
        reader_done.store(true, Ordering::Relaxed);
    });

    // Writer loop on this thread: stdin -> socket, watching for detach.
    let mut write_stream = stream;
    let mut stdin = std::io::stdin();
    let mut buf = [0u8; 1];
    while !done.load(Ordering::Relaxed) {
        match stdin.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if buf[0] == DETACH_CHAR {
                    break;
                }
                if write_stream.write_all(&buf).is_err() {
                    break;
                }
            }
        }
    }

    done.store(true, Ordering::Relaxed);
    let _ = write_stream.shutdown(std::net::Shutdown::Both);
    let _ = reader.join();

    restore_terminal(stdin_fd, orig);
    println!("\nDetaching from console...");
    Ok(())
}
