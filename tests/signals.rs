use nietzsche::signal;
use std::time::Duration;

#[test]
fn raised_signals_wake_the_pipe() {
    let pipe = signal::install_shutdown_signals().unwrap();

    unsafe { libc::raise(libc::SIGTERM) };
    pipe.wait().unwrap();

    // a second signal neither kills the process nor is lost
    unsafe { libc::raise(libc::SIGINT) };
    unsafe { libc::raise(libc::SIGTERM) };
    pipe.wait().unwrap();
    pipe.wait().unwrap();

    std::thread::sleep(Duration::from_millis(10));
}
