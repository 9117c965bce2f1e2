use std::{
    io::Read as _,
    os::unix::net::UnixStream,
    process::{Command, Stdio},
};

use anyhow::Context;
use byteorder::{NativeEndian, ReadBytesExt as _, WriteBytesExt as _};
use netlogind_protocol::MessageKind;
use ntest::timeout;

mod support;

// Scenario: a peer that speaks garbage gets its session terminated
// with a protocol error rather than wedging the daemon. Drives the
// wire by hand so the client binary's own checks can't get in the way.
#[test]
#[timeout(30000)]
fn unknown_tag_is_fatal_to_the_session() -> anyhow::Result<()> {
    if !support::is_root() {
        eprintln!("skipping: requires root");
        return Ok(());
    }

    let tmp_dir = tempfile::Builder::new()
        .prefix("netlogind-test")
        .rand_bytes(20)
        .tempdir()
        .context("creating tmp dir")?;
    let sock = tmp_dir.path().join("netlogind.sock");

    let mut daemon = Command::new(support::netlogind_bin())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .arg("--socket")
        .arg(&sock)
        .arg("--debug")
        .arg("--noauth")
        .spawn()
        .context("spawning daemon process")?;

    let sock_probe = sock.clone();
    support::wait_until(move || Ok(sock_probe.exists()))?;

    let mut conn = UnixStream::connect(&sock).context("dialing the daemon")?;

    // drain the username banner: Text("Username: ") then Prompt(1)
    let tag = conn.read_u32::<NativeEndian>().context("reading text tag")?;
    assert_eq!(tag, MessageKind::Text as u32);
    let len = conn.read_u32::<NativeEndian>().context("reading text len")?;
    let mut text = vec![0u8; len as usize];
    conn.read_exact(&mut text).context("reading text payload")?;
    assert_eq!(&text, b"Username: ");
    let tag = conn.read_u32::<NativeEndian>().context("reading prompt tag")?;
    assert_eq!(tag, MessageKind::Prompt as u32);
    let echo = conn.read_u32::<NativeEndian>().context("reading echo word")?;
    assert_eq!(echo, 1);

    // now answer with a tag nobody has ever heard of
    conn.write_u32::<NativeEndian>(9).context("writing bogus tag")?;

    let daemon_status = daemon.wait().context("waiting for daemon")?;
    assert!(!daemon_status.success());

    let mut daemon_stderr = String::new();
    daemon
        .stderr
        .take()
        .context("missing stderr")?
        .read_to_string(&mut daemon_stderr)
        .context("slurping daemon stderr")?;
    assert!(daemon_stderr.contains("unknown message tag 9"), "stderr: {daemon_stderr}");

    Ok(())
}
