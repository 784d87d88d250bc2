use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sha::sha256;
use openssl::symm::{Cipher, Crypter, Mode};

use super::types::{TlsError, TlsErrorKind};

const RSA_BITS: i32 = 2048;
const RSA_EXPONENT: u32 = 65537;
const PRIME_CHECKS: i32 = 64;
const MAX_ATTEMPTS: usize = 100_000;

/// Deterministic byte stream: AES-128 in counter mode over zeros.
///
/// The key comes from the root private key and the counter from the seed, so
/// the same root and seed always yield the same bytes.
pub struct CounterStream {
    crypter: Crypter,
}

impl CounterStream {
    pub fn new(secret: &[u8], seed: &[u8]) -> Result<Self, TlsError> {
        let key = sha256(secret);
        let iv = sha256(seed);
        let crypter = Crypter::new(
            Cipher::aes_128_ctr(),
            Mode::Encrypt,
            &key[..16],
            Some(&iv[..16]),
        )?;
        Ok(Self { crypter })
    }

    pub fn fill(&mut self, out: &mut [u8]) -> Result<(), TlsError> {
        let zeros = vec![0u8; out.len()];
        let mut buffer = vec![0u8; out.len() + Cipher::aes_128_ctr().block_size()];
        let written = self.crypter.update(&zeros, &mut buffer)?;
        if written != out.len() {
            return Err(TlsError::new(
                TlsErrorKind::Signing,
                format!("keystream returned {written} of {} bytes", out.len()),
            ));
        }
        out.copy_from_slice(&buffer[..written]);
        Ok(())
    }
}

pub fn rsa_key(stream: &mut CounterStream) -> Result<PKey<Private>, TlsError> {
    let mut ctx = BigNumContext::new()?;
    let e = BigNum::from_u32(RSA_EXPONENT)?;
    let half = (RSA_BITS / 2) as usize;

    let p = prime(stream, half, &mut ctx)?;
    let mut q = prime(stream, half, &mut ctx)?;
    while q == p {
        q = prime(stream, half, &mut ctx)?;
    }
    let (p, q) = if p > q { (p, q) } else { (q, p) };

    let mut n = BigNum::new()?;
    n.checked_mul(&p, &q, &mut ctx)?;
    if n.num_bits() != RSA_BITS {
        return Err(TlsError::new(
            TlsErrorKind::Signing,
            format!("modulus has {} bits", n.num_bits()),
        ));
    }

    let one = BigNum::from_u32(1)?;
    let mut p1 = BigNum::new()?;
    p1.checked_sub(&p, &one)?;
    let mut q1 = BigNum::new()?;
    q1.checked_sub(&q, &one)?;
    let mut phi = BigNum::new()?;
    phi.checked_mul(&p1, &q1, &mut ctx)?;

    let mut d = BigNum::new()?;
    d.mod_inverse(&e, &phi, &mut ctx)?;
    let mut dmp1 = BigNum::new()?;
    dmp1.nnmod(&d, &p1, &mut ctx)?;
    let mut dmq1 = BigNum::new()?;
    dmq1.nnmod(&d, &q1, &mut ctx)?;
    let mut iqmp = BigNum::new()?;
    iqmp.mod_inverse(&q, &p, &mut ctx)?;

    let rsa = Rsa::from_private_components(n, e, d, p, q, dmp1, dmq1, iqmp)?;
    if !rsa.check_key()? {
        return Err(TlsError::new(TlsErrorKind::Signing, "derived RSA key failed check"));
    }
    Ok(PKey::from_rsa(rsa)?)
}

fn prime(
    stream: &mut CounterStream,
    bits: usize,
    ctx: &mut BigNumContext,
) -> Result<BigNum, TlsError> {
    let one = BigNum::from_u32(1)?;
    let mut bytes = vec![0u8; bits / 8];
    for _ in 0..MAX_ATTEMPTS {
        stream.fill(&mut bytes)?;
        // Two top bits keep the product at full length, low bit keeps it odd.
        bytes[0] |= 0xC0;
        if let Some(last) = bytes.last_mut() {
            *last |= 0x01;
        }
        let candidate = BigNum::from_slice(&bytes)?;
        if !candidate.is_prime_fasttest(PRIME_CHECKS, ctx, true)? {
            continue;
        }
        let mut minus_one = BigNum::new()?;
        minus_one.checked_sub(&candidate, &one)?;
        if minus_one.mod_word(RSA_EXPONENT.into())? == 0 {
            continue;
        }
        return Ok(candidate);
    }
    Err(TlsError::new(TlsErrorKind::Signing, "prime search exhausted"))
}

pub fn p256_key(stream: &mut CounterStream) -> Result<PKey<Private>, TlsError> {
    let mut ctx = BigNumContext::new()?;
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let mut order = BigNum::new()?;
    group.order(&mut order, &mut ctx)?;

    let mut bytes = [0u8; 32];
    for _ in 0..MAX_ATTEMPTS {
        stream.fill(&mut bytes)?;
        let scalar = BigNum::from_slice(&bytes)?;
        if scalar.num_bits() == 0 || scalar >= order {
            continue;
        }
        let mut public = EcPoint::new(&group)?;
        public.mul_generator2(&group, &scalar, &mut ctx)?;
        let key = EcKey::from_private_components(&group, &scalar, &public)?;
        key.check_key()?;
        return Ok(PKey::from_ec_key(key)?);
    }
    Err(TlsError::new(TlsErrorKind::Signing, "scalar search exhausted"))
}
