//! Text adapter: CRLF command lines, one reply line each.
//!
//! Every firmware revision answers this protocol, so it is the final fallback.

use super::StateReport;
use crate::config::TimingConfig;
use crate::error::{TransportError, TransportResult};
use crate::protocol::{FwState, Request};
use crate::serial::Link;

/// Send one command line and read one reply line.
///
/// The caller's line ending is replaced with CRLF. For queries the reply
/// must start with an integer; command acknowledgements may be any line and
/// yield `0` when not numeric.
pub async fn exchange(
    link: &mut Link,
    timing: &TimingConfig,
    line: &str,
    query: bool,
) -> TransportResult<i32> {
    let command = line.trim_end_matches(['\r', '\n']);
    let mut out = Vec::with_capacity(command.len() + 2);
    out.extend_from_slice(command.as_bytes());
    out.extend_from_slice(b"\r\n");

    link.consume(link.buffered());
    link.write_all(&out).await?;

    let reply = link.read_until(b'\n', timing.text_timeout).await?;
    let reply = String::from_utf8_lossy(&reply);
    let reply = reply.trim();
    tracing::trace!(command, reply, "Text exchange");

    match parse_leading_int(reply) {
        Some(value) => Ok(value),
        None if !query => Ok(0),
        None => Err(TransportError::Parse(reply.to_string())),
    }
}

/// Send a typed request as a text line.
pub async fn request(link: &mut Link, timing: &TimingConfig, req: Request) -> TransportResult<i32> {
    exchange(link, timing, &req.text_line(), req.is_query()).await
}

/// `STATUS`, `POS`, `SLOTS` in sequence.
pub async fn read_state(link: &mut Link, timing: &TimingConfig) -> TransportResult<StateReport> {
    let code = request(link, timing, Request::GetState).await?;
    let fw_pos = request(link, timing, Request::GetPosition).await?;
    let slots = request(link, timing, Request::GetSlots).await?;

    let state = u8::try_from(code)
        .map(FwState::from_code)
        .unwrap_or(FwState::Unknown);

    Ok(StateReport {
        state,
        fw_pos,
        slots,
    })
}

/// Leading optionally-signed decimal integer, like C `atoi` but strict:
/// at least one digit is required.
pub fn parse_leading_int(s: &str) -> Option<i32> {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let magnitude: i64 = digits[..end].parse().ok()?;
    let value = if negative { -magnitude } else { magnitude };
    i32::try_from(value).ok()
}
