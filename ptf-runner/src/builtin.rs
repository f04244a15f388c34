//! Test implementations shipped with the `ptf` binary. They exercise the
//! loopback dataplane and back the manifests under `demos/`.

use crate::registry::{TestError, TestRegistry};
use crate::session::TestContext;
use std::time::Duration;

const FRAME_LEN: usize = 64;

pub fn registry() -> TestRegistry {
  let mut registry = TestRegistry::new();
  registry
    .register_fn("loopback.Echo", echo)
    .register_fn("loopback.Silence", silence)
    .register_fn("loopback.Sized", sized)
    .register_fn("loopback.Hardware", hardware)
    .register_fn("loopback.Hang", hang);
  registry
}

fn frame(port: u32, len: usize) -> Vec<u8> {
  let mut frame = vec![0u8; len];
  // Broadcast destination, locally administered source.
  frame[..6].fill(0xff);
  frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, port as u8]);
  for (i, byte) in frame.iter_mut().enumerate().skip(14) {
    *byte = i as u8;
  }
  frame
}

/// Every mapped port returns what was sent on it.
fn echo(ctx: &TestContext<'_>) -> Result<(), TestError> {
  for (device, port, interface) in ctx.port_map().iter() {
    let sent = frame(port, FRAME_LEN);
    ctx.send(device, port, &sent)?;
    match ctx.poll(device, port)? {
      Some(received) if received == sent => {}
      Some(received) => {
        return Err(TestError::fail(format!(
          "{interface}: received {} byte(s) that differ from the {} sent",
          received.len(),
          sent.len()
        )))
      }
      None => return Err(TestError::fail(format!("{interface}: no frame received"))),
    }
  }
  Ok(())
}

/// Nothing arrives on a port nobody sent to.
fn silence(ctx: &TestContext<'_>) -> Result<(), TestError> {
  let Some((device, port, interface)) = ctx.port_map().iter().next() else {
    return Err(TestError::error("no ports mapped"));
  };
  let timeout = ctx.negative_timeout();
  match ctx.dataplane().poll(device, port, timeout, ctx.cancel())? {
    None => Ok(()),
    Some(_) => Err(TestError::fail(format!(
      "{interface}: unexpected frame within {timeout:?}"
    ))),
  }
}

/// Frame length comes from the `frame_len` parameter.
fn sized(ctx: &TestContext<'_>) -> Result<(), TestError> {
  let len = match ctx.params().get("frame_len") {
    Some(value) => value
      .as_i64()
      .and_then(|len| usize::try_from(len).ok())
      .ok_or_else(|| {
        TestError::error(format!("frame_len must be a positive integer, got {value}"))
      })?,
    None => FRAME_LEN,
  };
  if len < 14 {
    return Err(TestError::error(format!("frame_len {len} is shorter than a header")));
  }
  let Some((device, port, _)) = ctx.port_map().iter().next() else {
    return Err(TestError::error("no ports mapped"));
  };
  ctx.send(device, port, &frame(port, len))?;
  match ctx.poll(device, port)? {
    Some(received) if received.len() == len => Ok(()),
    Some(received) => Err(TestError::fail(format!(
      "expected {len} byte(s), received {}",
      received.len()
    ))),
    None => Err(TestError::fail("no frame received")),
  }
}

/// Declines to run unless `hw=true` is passed.
fn hardware(ctx: &TestContext<'_>) -> Result<(), TestError> {
  if ctx.params().get("hw").and_then(|value| value.as_bool()) != Some(true) {
    ctx.skip("requires hw=true");
    return Ok(());
  }
  echo(ctx)
}

/// Blocks until its deadline fires.
fn hang(ctx: &TestContext<'_>) -> Result<(), TestError> {
  ctx.cancel().wait_timeout(Duration::from_secs(3600))?;
  Err(TestError::fail("was never cancelled"))
}
