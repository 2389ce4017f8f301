//! Systematic MDS erasure code over GF(2^8).
//!
//! Encoding multiplies the column of `k` source blocks by a `(k+m) x k`
//! generator matrix whose top `k` rows are the identity, so the first `k`
//! outputs are the sources themselves and the remaining `m` are repair
//! blocks. The generator is a Vandermonde matrix right-multiplied by the
//! inverse of its own top `k x k` block; any `k` rows of the result stay
//! invertible, which is exactly the MDS guarantee: any `k` of the `k+m`
//! blocks recover the sources.

use tracing::warn;

use crate::gf::{gf_pow, mul_add_slice, mul_slice, Gf256};
use crate::{Error, Result, MAX_TOTAL_BLOCKS};

/// Stateless block encoder/decoder for a fixed rate `(k, m)` and block size.
///
/// The codec holds its generator matrix and nothing else; it is free of
/// per-call state and safe to share behind `&self`.
#[derive(Debug, Clone)]
pub struct BlockCodec {
    k: usize,
    m: usize,
    block_size: usize,
    /// `(k + m) x k` generator; rows `0..k` are the identity.
    generator: Vec<Vec<Gf256>>,
}

impl BlockCodec {
    /// Build a codec for `k` source blocks and `m` repair blocks of
    /// `block_size` bytes each.
    ///
    /// Requires `k >= 1`, `m >= 1` and `k + m <= 255`.
    pub fn new(k: u32, m: u32, block_size: usize) -> Result<Self> {
        if k == 0 || m == 0 || k + m > MAX_TOTAL_BLOCKS {
            return Err(Error::InvalidRate { k, m });
        }
        if block_size == 0 {
            return Err(Error::BlockSizeMismatch {
                expected: 1,
                got: 0,
            });
        }

        let k = k as usize;
        let m = m as usize;

        let vandermonde = vandermonde(k + m, k);
        let top: Vec<Vec<Gf256>> = vandermonde[..k].to_vec();
        // Vandermonde rows with distinct evaluation points are linearly
        // independent, so the top block always inverts.
        let top_inv = invert(top).ok_or(Error::InvalidRate {
            k: k as u32,
            m: m as u32,
        })?;
        let generator = matmul(&vandermonde, &top_inv);

        Ok(Self {
            k,
            m,
            block_size,
            generator,
        })
    }

    /// Number of source blocks per group.
    pub fn k(&self) -> u32 {
        self.k as u32
    }

    /// Number of repair blocks per group.
    pub fn m(&self) -> u32 {
        self.m as u32
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Produce the `m` repair blocks for `k` source blocks.
    ///
    /// Every source block must be exactly `block_size` bytes.
    pub fn encode(&self, sources: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        let mut repairs: Vec<Vec<u8>> = (0..self.m).map(|_| vec![0u8; self.block_size]).collect();
        self.encode_into(sources, &mut repairs)?;
        Ok(repairs)
    }

    /// Like [`encode`](Self::encode), but writes into caller-provided
    /// buffers (each `block_size` bytes) so blocks can come from a pool.
    pub fn encode_into(&self, sources: &[Vec<u8>], repairs: &mut [Vec<u8>]) -> Result<()> {
        if sources.len() != self.k {
            return Err(Error::InsufficientBlocks {
                have: sources.len(),
                need: self.k,
            });
        }
        for block in sources {
            if block.len() != self.block_size {
                return Err(Error::BlockSizeMismatch {
                    expected: self.block_size,
                    got: block.len(),
                });
            }
        }
        debug_assert_eq!(repairs.len(), self.m);

        for (r, out) in repairs.iter_mut().enumerate() {
            debug_assert_eq!(out.len(), self.block_size);
            let row = &self.generator[self.k + r];
            mul_slice(out, &sources[0], row[0].0);
            for (j, source) in sources.iter().enumerate().skip(1) {
                mul_add_slice(out, source, row[j].0);
            }
        }

        Ok(())
    }

    /// Recover the `k` source blocks from any `k` distinct-index blocks.
    ///
    /// `shares` pairs each block with its index in `0..k+m`. Indices outside
    /// that range are ignored; a repeated index is rejected with
    /// [`Error::DuplicateIndex`]. When only source indices are present the
    /// decode is the identity permutation.
    pub fn decode(&self, shares: &[(u32, &[u8])]) -> Result<Vec<Vec<u8>>> {
        let total = (self.k + self.m) as u32;
        let mut seen = vec![false; self.k + self.m];
        let mut sources: Vec<(usize, &[u8])> = Vec::new();
        let mut repairs: Vec<(usize, &[u8])> = Vec::new();

        for &(index, block) in shares {
            if index >= total {
                continue;
            }
            let idx = index as usize;
            if seen[idx] {
                return Err(Error::DuplicateIndex(index));
            }
            seen[idx] = true;
            if block.len() != self.block_size {
                return Err(Error::BlockSizeMismatch {
                    expected: self.block_size,
                    got: block.len(),
                });
            }
            if idx < self.k {
                sources.push((idx, block));
            } else {
                repairs.push((idx, block));
            }
        }

        let have = sources.len() + repairs.len();
        if have < self.k {
            return Err(Error::InsufficientBlocks {
                have,
                need: self.k,
            });
        }

        // Prefer source rows: they are identity rows, and if they alone cover
        // the group the decode is a straight copy.
        sources.sort_unstable_by_key(|&(idx, _)| idx);
        repairs.sort_unstable_by_key(|&(idx, _)| idx);

        if sources.len() == self.k {
            return Ok(sources
                .into_iter()
                .map(|(_, block)| block.to_vec())
                .collect());
        }

        let chosen: Vec<(usize, &[u8])> = sources
            .into_iter()
            .chain(repairs)
            .take(self.k)
            .collect();

        // Invert the k x k submatrix of generator rows at the chosen indices.
        let submatrix: Vec<Vec<Gf256>> = chosen
            .iter()
            .map(|&(idx, _)| self.generator[idx].clone())
            .collect();
        let inverse = match invert(submatrix) {
            Some(inv) => inv,
            None => {
                warn!(k = self.k, m = self.m, "decode submatrix not invertible");
                return Err(Error::InsufficientBlocks {
                    have,
                    need: self.k,
                });
            }
        };

        let mut recovered: Vec<Vec<u8>> = (0..self.k).map(|_| vec![0u8; self.block_size]).collect();
        for (j, out) in recovered.iter_mut().enumerate() {
            let row = &inverse[j];
            mul_slice(out, chosen[0].1, row[0].0);
            for (i, &(_, block)) in chosen.iter().enumerate().skip(1) {
                mul_add_slice(out, block, row[i].0);
            }
        }

        Ok(recovered)
    }
}

/// `rows x cols` Vandermonde matrix with evaluation points `x_i = i`.
fn vandermonde(rows: usize, cols: usize) -> Vec<Vec<Gf256>> {
    (0..rows)
        .map(|i| {
            let x = Gf256(i as u8);
            (0..cols).map(|j| gf_pow(x, j as u32)).collect()
        })
        .collect()
}

/// `a (r x n) * b (n x c)` over GF(2^8).
fn matmul(a: &[Vec<Gf256>], b: &[Vec<Gf256>]) -> Vec<Vec<Gf256>> {
    let n = b.len();
    let cols = b[0].len();
    a.iter()
        .map(|row| {
            (0..cols)
                .map(|j| {
                    let mut acc = Gf256(0);
                    for i in 0..n {
                        acc = acc + row[i] * b[i][j];
                    }
                    acc
                })
                .collect()
        })
        .collect()
}

/// Gauss-Jordan inversion; `None` when the matrix is singular.
fn invert(mut a: Vec<Vec<Gf256>>) -> Option<Vec<Vec<Gf256>>> {
    let n = a.len();
    let mut inv: Vec<Vec<Gf256>> = (0..n)
        .map(|i| (0..n).map(|j| Gf256(u8::from(i == j))).collect())
        .collect();

    for col in 0..n {
        let pivot = (col..n).find(|&r| a[r][col] != Gf256(0))?;
        a.swap(col, pivot);
        inv.swap(col, pivot);

        let p = a[col][col];
        for j in 0..n {
            a[col][j] = a[col][j] / p;
            inv[col][j] = inv[col][j] / p;
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == Gf256(0) {
                continue;
            }
            for j in 0..n {
                let s = a[col][j];
                a[row][j] = a[row][j] - factor * s;
                let t = inv[col][j];
                inv[row][j] = inv[row][j] - factor * t;
            }
        }
    }

    Some(inv)
}
