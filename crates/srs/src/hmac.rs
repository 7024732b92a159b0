//! HMAC-SHA1, built directly atop the `sha1` crate's digest rather than
//! pulled in as a pre-built HMAC crate, so the streaming
//! `new`/`update`/`finalize` shape matches the rest of this codec's
//! multi-argument signing calls (one `update` per positional field, no
//! manual delimiter bookkeeping).

use sha1::{Digest, Sha1};

const BLOCK_SIZE: usize = 64;
const IPAD: u8 = 0x36;
const OPAD: u8 = 0x5c;

pub struct HmacSha1 {
    inner: Sha1,
    opad_key: [u8; BLOCK_SIZE],
}

impl HmacSha1 {
    pub fn new(key: &[u8]) -> Self {
        let mut key_block = [0u8; BLOCK_SIZE];
        if key.len() > BLOCK_SIZE {
            let digest = Sha1::digest(key);
            key_block[..digest.len()].copy_from_slice(&digest);
        } else {
            key_block[..key.len()].copy_from_slice(key);
        }

        let mut ipad = [0u8; BLOCK_SIZE];
        let mut opad_key = [0u8; BLOCK_SIZE];
        for i in 0..BLOCK_SIZE {
            ipad[i] = key_block[i] ^ IPAD;
            opad_key[i] = key_block[i] ^ OPAD;
        }

        let mut inner = Sha1::new();
        inner.update(ipad);
        HmacSha1 { inner, opad_key }
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        self.inner.update(data);
        self
    }

    pub fn finalize(self) -> [u8; 20] {
        let inner_digest = self.inner.finalize();
        let mut outer = Sha1::new();
        outer.update(self.opad_key);
        outer.update(inner_digest);
        outer.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_rfc2202_vector() {
        // RFC 2202 test case 1.
        let key = [0x0bu8; 20];
        let mut mac = HmacSha1::new(&key);
        mac.update(b"Hi There");
        let digest = mac.finalize();
        assert_eq!(hex(&digest), "b617318655057264e28bc0b6fb378c8ef146be00");
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
