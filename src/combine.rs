use std::sync::OnceLock;

pub(super) const CRC32_IEEE_POLY: u32 = 0xedb8_8320;

// Each matrix is a linear operator on CRC states over GF(2): row n is the
// image of the state with only bit n set.
fn matrix_mult(mat: &[u32; 32], vec: u32) -> u32 {
    let mut sum = 0;
    let mut vec = vec;
    while vec != 0 {
        let n = vec.trailing_zeros() as usize;
        sum ^= mat[n];
        vec &= vec - 1;
    }
    sum
}

// square = mat * mat, i.e. the operator applied twice.
fn matrix_square(square: &mut [u32; 32], mat: &[u32; 32]) {
    for n in 0..32 {
        square[n] = matrix_mult(mat, mat[n]);
    }
}

pub(super) struct Crc32Matrix {
    // zeros[k] appends 2^k zero bytes to a CRC state.
    zeros: [[u32; 32]; 64],
}

impl Crc32Matrix {
    pub(super) fn new(poly: u32) -> Self {
        // Operator for appending a single zero bit.
        let mut odd = [0u32; 32];
        odd[0] = poly;
        let mut row = 1u32;
        for entry in odd.iter_mut().skip(1) {
            *entry = row;
            row <<= 1;
        }

        // Two zero bits, then four.
        let mut even = [0u32; 32];
        matrix_square(&mut even, &odd);
        matrix_square(&mut odd, &even);

        // Eight zero bits is one zero byte; every further squaring doubles
        // the byte count.
        let mut zeros = [[0u32; 32]; 64];
        matrix_square(&mut zeros[0], &odd);
        for k in 1..64 {
            let (done, rest) = zeros.split_at_mut(k);
            matrix_square(&mut rest[0], &done[k - 1]);
        }

        Self { zeros }
    }
}

// combine_crc32(mat, crc(A), crc(B), |B|) == crc(AB) for the polynomial the
// matrix was built for. CRC values are the finalized (post-inversion) form
// produced by any standard CRC-32 implementation.
pub(super) fn combine_crc32(mat: &Crc32Matrix, crc_a: u32, crc_b: u32, len_b: u64) -> u32 {
    let mut crc = crc_a;
    let mut remaining = len_b;
    while remaining != 0 {
        let k = remaining.trailing_zeros() as usize;
        crc = matrix_mult(&mat.zeros[k], crc);
        remaining &= remaining - 1;
    }
    crc ^ crc_b
}

pub(super) fn ieee_matrix() -> &'static Crc32Matrix {
    static MATRIX: OnceLock<Crc32Matrix> = OnceLock::new();
    MATRIX.get_or_init(|| Crc32Matrix::new(CRC32_IEEE_POLY))
}
