use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;


/// Fixed bit-mixing applied to the handshake word on both sides. This is
///  obfuscation to keep trivial port scanners from getting past validation,
///  not authentication — and deliberately not an involution: validation
///  applies it exactly once per side.
pub(crate) fn scramble(input: u64) -> u64 {
    let out = input ^ 0xfadedbeefcafe;
    let out = ((out & 0xabcdef) >> 3) | ((out & 0xfedcab) << 12);
    out ^ 0xdeadfacade
}

/// Server half of the validation exchange: emit a clock-seeded challenge and
///  expect it back scrambled. A mismatch is an error — the caller closes the
///  socket without sending anything further to the peer.
pub(crate) async fn server_handshake<S>(stream: &mut S) -> anyhow::Result<()>
where S: AsyncRead + AsyncWrite + Unpin {
    let challenge = clock_seed();
    let expected = scramble(challenge);

    stream.write_all(&challenge.to_le_bytes()).await?;

    let mut raw = [0u8; 8];
    stream.read_exact(&mut raw).await?;
    let answer = u64::from_le_bytes(raw);

    if answer != expected {
        return Err(anyhow!("handshake validation failed"));
    }

    trace!("peer validated");
    Ok(())
}

/// Client half: receive the server's challenge and send it back scrambled.
pub(crate) async fn client_handshake<S>(stream: &mut S) -> anyhow::Result<()>
where S: AsyncRead + AsyncWrite + Unpin {
    let mut raw = [0u8; 8];
    stream.read_exact(&mut raw).await?;
    let challenge = u64::from_le_bytes(raw);

    stream.write_all(&scramble(challenge).to_le_bytes()).await?;
    Ok(())
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before UNIX epoch")
        .as_nanos() as u64
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(0x123456789abcdef0)]
    #[case(u64::MAX)]
    fn test_scramble_deterministic(#[case] input: u64) {
        assert_eq!(scramble(input), scramble(input));
        assert_ne!(scramble(input), input);
    }

    #[rstest]
    #[case(0x123456789abcdef0)]
    #[case(0xdeadbeefdeadbeef)]
    fn test_scramble_is_not_an_involution(#[case] input: u64) {
        // scramble's image is confined to the low bits, so any input with
        // high bits set cannot survive a double application
        assert_ne!(scramble(scramble(input)), input);
    }

    #[tokio::test]
    async fn test_handshake_succeeds() {
        let (mut server_side, mut client_side) = tokio::io::duplex(64);

        let (server, client) = tokio::join!(
            server_handshake(&mut server_side),
            client_handshake(&mut client_side),
        );

        assert!(server.is_ok());
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_answer() {
        let (mut server_side, mut client_side) = tokio::io::duplex(64);

        let (server, _) = tokio::join!(
            server_handshake(&mut server_side),
            async {
                let mut raw = [0u8; 8];
                client_side.read_exact(&mut raw).await.unwrap();
                let challenge = u64::from_le_bytes(raw);

                // answer with the raw challenge instead of the scrambled one
                client_side.write_all(&challenge.to_le_bytes()).await.unwrap();
            },
        );

        assert!(server.is_err());
    }

    #[tokio::test]
    async fn test_handshake_fails_on_peer_hangup() {
        let (mut server_side, client_side) = tokio::io::duplex(64);
        drop(client_side);

        assert!(server_handshake(&mut server_side).await.is_err());
    }
}
