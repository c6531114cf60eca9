//! Edge→exit credential envelope.
//!
//! Sent once per tunnel, immediately after the AEAD salt and before any
//! relayed bytes: a fixed 8-byte username and 32-byte password, both
//! right-padded with spaces, followed by the SOCKS-encoded target address.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::common::error::{ProxyError, Result};

pub const USER_LEN: usize = 8;
pub const PASS_LEN: usize = 32;
pub const ENVELOPE_LEN: usize = USER_LEN + PASS_LEN;

const PAD: u8 = 0x20;

/// Encode credentials into the fixed-size block. Over-length fields are a
/// configuration error, caught at session start on the edge.
pub fn encode(username: &str, password: &str) -> Result<[u8; ENVELOPE_LEN]> {
    let user = username.as_bytes();
    let pass = password.as_bytes();
    if user.len() > USER_LEN || pass.len() > PASS_LEN {
        return Err(ProxyError::Config(format!(
            "credentials exceed envelope: user ≤ {} bytes, password ≤ {} bytes",
            USER_LEN, PASS_LEN
        )));
    }

    let mut block = [PAD; ENVELOPE_LEN];
    block[..user.len()].copy_from_slice(user);
    block[USER_LEN..USER_LEN + pass.len()].copy_from_slice(pass);
    Ok(block)
}

/// Read the credential block, stripping the wire padding.
pub async fn read_from<R>(r: &mut R) -> Result<(String, String)>
where
    R: AsyncRead + Unpin,
{
    let mut block = [0u8; ENVELOPE_LEN];
    r.read_exact(&mut block).await?;

    let user = unpad(&block[..USER_LEN])?;
    let pass = unpad(&block[USER_LEN..])?;
    Ok((user, pass))
}

fn unpad(field: &[u8]) -> Result<String> {
    let end = field
        .iter()
        .rposition(|&b| b != PAD)
        .map(|p| p + 1)
        .unwrap_or(0);
    String::from_utf8(field[..end].to_vec()).map_err(|_| ProxyError::BadRequest)
}
