//! TCP echo server on the weft runtime.
//!
//! One fiber per connection, written as plain blocking reads and
//! writes; the runtime parks fibers on readiness instead of blocking
//! worker threads.
//!
//! ```sh
//! weft-echo 7777
//! # elsewhere: ncat 127.0.0.1 7777
//! ```

use anyhow::{bail, Context, Result};
use weft::{fd_table, hook, spawn, winfo, Reactor};

fn make_listener(port: u16) -> Result<i32> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        bail!("socket: {}", std::io::Error::last_os_error());
    }

    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
    addr.sin_port = port.to_be();
    let rt = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rt != 0 {
        bail!("bind 0.0.0.0:{}: {}", port, std::io::Error::last_os_error());
    }
    if unsafe { libc::listen(fd, 128) } != 0 {
        bail!("listen: {}", std::io::Error::last_os_error());
    }

    // Register with the runtime so the hooked accept parks instead of
    // spinning on EAGAIN.
    fd_table().get(fd, true);
    Ok(fd)
}

fn serve_client(fd: i32) {
    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe { hook::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        let mut off = 0usize;
        while off < n as usize {
            let w = unsafe {
                hook::write(
                    fd,
                    buf[off..].as_ptr() as *const libc::c_void,
                    n as usize - off,
                )
            };
            if w <= 0 {
                hook::close(fd);
                return;
            }
            off += w as usize;
        }
    }
    hook::close(fd);
}

fn main() -> Result<()> {
    let port: u16 = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "7777".into())
        .parse()
        .context("port must be a number")?;

    let listener = make_listener(port)?;
    let _reactor = Reactor::new(4, false, "echo")?;
    winfo!("echo: listening on 0.0.0.0:{}", port);

    spawn(move || loop {
        let client = unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if client < 0 {
            continue;
        }
        let _ = spawn(move || serve_client(client));
    })?;

    // The acceptor never finishes; park this thread for good.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
