//! Reed-Solomon RS(255,223) error correction over GF(2^8).
//!
//! Systematic encoding with primitive polynomial 0x11D and first consecutive
//! root alpha^0. Decoding uses syndromes, Berlekamp-Massey, Chien search and
//! Forney. Blocks shorter than 255 bytes are shortened codes: the missing
//! leading data bytes are treated as zeros and never transmitted.

use crate::error::{Result, TunnelError};
use crate::{RS_DATA_BYTES, RS_ECC_BYTES, RS_TOTAL_BYTES};
use serde::Serialize;
use std::sync::OnceLock;

/// Primitive polynomial for GF(2^8): x^8 + x^4 + x^3 + x^2 + 1.
const PRIM_POLY: u16 = 0x11D;

/// Correctable byte errors per block.
pub const RS_MAX_CORRECTABLE: usize = RS_ECC_BYTES / 2;

struct GfTables {
    exp: [u8; 512],
    log: [u8; 256],
}

fn build_gf_tables() -> GfTables {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];

    let mut x: u16 = 1;
    for i in 0..255usize {
        exp[i] = x as u8;
        exp[i + 255] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= PRIM_POLY;
        }
    }
    exp[510] = exp[0];
    exp[511] = exp[1];

    GfTables { exp, log }
}

fn gf_tables() -> &'static GfTables {
    static TABLES: OnceLock<GfTables> = OnceLock::new();
    TABLES.get_or_init(build_gf_tables)
}

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = gf_tables();
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

/// Multiplicative inverse; `a` must be non-zero.
fn gf_inv(a: u8) -> u8 {
    let t = gf_tables();
    t.exp[255 - t.log[a as usize] as usize]
}

/// alpha^power for any power, negative powers included.
fn gf_alpha_pow(power: i32) -> u8 {
    gf_tables().exp[power.rem_euclid(255) as usize]
}

/// Evaluate a polynomial stored highest-degree first.
fn poly_eval(poly: &[u8], x: u8) -> u8 {
    poly.iter().fold(0u8, |acc, &coeff| gf_mul(acc, x) ^ coeff)
}

/// Evaluate a polynomial stored lowest-degree first.
fn poly_eval_asc(poly: &[u8], x: u8) -> u8 {
    let mut result = 0u8;
    let mut x_pow = 1u8;
    for &coeff in poly {
        result ^= gf_mul(coeff, x_pow);
        x_pow = gf_mul(x_pow, x);
    }
    result
}

/// g(x) = prod_{i=0}^{31} (x - alpha^i), highest-degree first.
fn generator_poly() -> &'static [u8] {
    static GEN: OnceLock<Vec<u8>> = OnceLock::new();
    GEN.get_or_init(|| {
        let mut gpoly = vec![1u8];
        for i in 0..RS_ECC_BYTES {
            let root = gf_alpha_pow(i as i32);
            let mut next = vec![0u8; gpoly.len() + 1];
            for (j, &coeff) in gpoly.iter().enumerate() {
                next[j] ^= coeff;
                next[j + 1] ^= gf_mul(coeff, root);
            }
            gpoly = next;
        }
        gpoly
    })
}

/// Monotonic FEC counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FecStats {
    pub encodes: u64,
    pub decodes: u64,
    pub clean_frames: u64,
    pub errors_corrected: u64,
    pub uncorrectable_frames: u64,
}

/// Reed-Solomon codec with running statistics
#[derive(Debug, Default)]
pub struct FecCodec {
    stats: FecStats,
}

impl FecCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encoded_len(data_len: usize) -> usize {
        data_len + RS_ECC_BYTES
    }

    pub fn data_len(encoded_len: usize) -> usize {
        encoded_len.saturating_sub(RS_ECC_BYTES)
    }

    /// Encode up to `RS_DATA_BYTES` of data, returning `data ++ parity`.
    pub fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() > RS_DATA_BYTES {
            return Err(TunnelError::Config(format!(
                "FEC block holds at most {} bytes, got {}",
                RS_DATA_BYTES,
                data.len()
            )));
        }

        let gpoly = generator_poly();
        let mut parity = [0u8; RS_ECC_BYTES];
        for &byte in data {
            let feedback = byte ^ parity[0];
            for j in 0..RS_ECC_BYTES - 1 {
                parity[j] = parity[j + 1] ^ gf_mul(feedback, gpoly[j + 1]);
            }
            parity[RS_ECC_BYTES - 1] = gf_mul(feedback, gpoly[RS_ECC_BYTES]);
        }

        let mut encoded = Vec::with_capacity(Self::encoded_len(data.len()));
        encoded.extend_from_slice(data);
        encoded.extend_from_slice(&parity);

        self.stats.encodes += 1;
        Ok(encoded)
    }

    /// Correct `codeword` in place and return the number of corrected bytes.
    ///
    /// `UncorrectableFec` means the data portion must be discarded; the buffer
    /// is left untouched in that case.
    pub fn decode(&mut self, codeword: &mut [u8]) -> Result<usize> {
        if codeword.len() < RS_ECC_BYTES || codeword.len() > RS_TOTAL_BYTES {
            return Err(TunnelError::Frame(format!(
                "codeword length {} outside {}..={}",
                codeword.len(),
                RS_ECC_BYTES,
                RS_TOTAL_BYTES
            )));
        }

        self.stats.decodes += 1;
        match correct_block(codeword) {
            Some(0) => {
                self.stats.clean_frames += 1;
                Ok(0)
            }
            Some(corrected) => {
                self.stats.errors_corrected += corrected as u64;
                Ok(corrected)
            }
            None => {
                self.stats.uncorrectable_frames += 1;
                Err(TunnelError::UncorrectableFec)
            }
        }
    }

    pub fn stats(&self) -> FecStats {
        self.stats
    }
}

/// Syndromes S_i = r(alpha^i), i = 0..31.
fn syndromes(block: &[u8]) -> [u8; RS_ECC_BYTES] {
    let mut out = [0u8; RS_ECC_BYTES];
    for (i, s) in out.iter_mut().enumerate() {
        *s = poly_eval(block, gf_alpha_pow(i as i32));
    }
    out
}

/// Error locator sigma(x), lowest-degree first, sigma[0] = 1.
fn berlekamp_massey(synd: &[u8]) -> Vec<u8> {
    let n = synd.len();
    let mut c = vec![0u8; n + 1];
    let mut b = vec![0u8; n + 1];
    c[0] = 1;
    b[0] = 1;

    let mut ell = 0usize;
    let mut shift = 1usize;
    let mut prev_delta = 1u8;

    for r in 0..n {
        let mut delta = synd[r];
        for i in 1..=ell {
            delta ^= gf_mul(c[i], synd[r - i]);
        }

        if delta == 0 {
            shift += 1;
            continue;
        }

        let factor = gf_mul(delta, gf_inv(prev_delta));
        if 2 * ell <= r {
            let saved = c.clone();
            for j in 0..=n - shift {
                c[j + shift] ^= gf_mul(factor, b[j]);
            }
            b = saved;
            ell = r + 1 - ell;
            prev_delta = delta;
            shift = 1;
        } else {
            for j in 0..=n - shift {
                c[j + shift] ^= gf_mul(factor, b[j]);
            }
            shift += 1;
        }
    }

    c.truncate(ell + 1);
    c
}

/// Returns the number of corrected bytes, or None when the block is beyond repair.
fn correct_block(block: &mut [u8]) -> Option<usize> {
    let len = block.len();
    let synd = syndromes(block);
    if synd.iter().all(|&s| s == 0) {
        return Some(0);
    }

    let sigma = berlekamp_massey(&synd);
    let num_errors = sigma.len() - 1;
    if num_errors == 0 || num_errors > RS_MAX_CORRECTABLE {
        return None;
    }

    // Chien search over the transmitted positions only. Index k holds the
    // coefficient of x^(len-1-k); a root at alpha^-(len-1-k) marks an error there.
    let mut positions = Vec::with_capacity(num_errors);
    for k in 0..len {
        let degree = (len - 1 - k) as i32;
        if poly_eval_asc(&sigma, gf_alpha_pow(-degree)) == 0 {
            positions.push(k);
        }
    }
    // Roots in the virtual zero padding of a shortened code also land here
    if positions.len() != num_errors {
        return None;
    }

    // Forney with first root alpha^0: e = X * Omega(X^-1) / Sigma'(X^-1)
    let mut omega = vec![0u8; RS_ECC_BYTES];
    for (i, &s_coeff) in sigma.iter().enumerate() {
        for (j, &syn) in synd.iter().enumerate() {
            if i + j < RS_ECC_BYTES {
                omega[i + j] ^= gf_mul(s_coeff, syn);
            }
        }
    }
    let mut sigma_prime = vec![0u8; sigma.len() - 1];
    for i in (1..sigma.len()).step_by(2) {
        sigma_prime[i - 1] = sigma[i];
    }

    let mut corrections = Vec::with_capacity(num_errors);
    for &k in &positions {
        let degree = (len - 1 - k) as i32;
        let x = gf_alpha_pow(degree);
        let x_inv = gf_alpha_pow(-degree);
        let denom = poly_eval_asc(&sigma_prime, x_inv);
        if denom == 0 {
            return None;
        }
        let magnitude = gf_mul(x, gf_mul(poly_eval_asc(&omega, x_inv), gf_inv(denom)));
        corrections.push((k, magnitude));
    }

    let mut repaired = block.to_vec();
    for &(k, magnitude) in &corrections {
        repaired[k] ^= magnitude;
    }
    if syndromes(&repaired).iter().any(|&s| s != 0) {
        return None;
    }

    block.copy_from_slice(&repaired);
    Some(num_errors)
}
