//! 负载均衡使用的哈希原语。

/// murmur3 32 位哈希（seed = 0），用于把目标 key 映射到 u32。
pub fn murmur3_32(data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h: u32 = 0;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut k: u32 = 0;
        for (i, &b) in rem.iter().enumerate() {
            k ^= (b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// jump consistent hash：把 64 位 key 映射到 [0, buckets) 内的一个桶。
///
/// buckets 必须 > 0。同一 key 在桶数不变时总是落在同一个桶；
/// 桶数从 n 增至 n+1 时只有 1/(n+1) 的 key 需要迁移。
pub fn jump_hash(mut key: u64, buckets: i32) -> i32 {
    debug_assert!(buckets > 0);

    let mut b: i64 = -1;
    let mut j: i64 = 0;

    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b.wrapping_add(1)) as f64 * ((1i64 << 31) as f64 / ((key >> 33).wrapping_add(1) as f64)))
            as i64;
    }

    b as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur3_known_vectors() {
        // 公开测试向量（seed = 0）
        assert_eq!(murmur3_32(b""), 0);
        assert_eq!(murmur3_32(b"hello"), 0x248b_fa47);
        assert_eq!(murmur3_32(b"hello, world"), 0x149b_bb7f);
        assert_eq!(murmur3_32(b"The quick brown fox jumps over the lazy dog"), 0x2e4f_f723);
    }

    #[test]
    fn murmur3_deterministic() {
        assert_eq!(murmur3_32(b"example.com"), murmur3_32(b"example.com"));
        assert_ne!(murmur3_32(b"example.com"), murmur3_32(b"example.org"));
    }

    #[test]
    fn jump_hash_single_bucket() {
        for key in [0u64, 1, 42, u64::MAX, 0xdeadbeef] {
            assert_eq!(jump_hash(key, 1), 0);
        }
    }

    #[test]
    fn jump_hash_in_range() {
        for key in 0..1000u64 {
            let idx = jump_hash(key.wrapping_mul(0x9e3779b97f4a7c15), 7);
            assert!((0..7).contains(&idx));
        }
    }

    #[test]
    fn jump_hash_two_buckets_roughly_even() {
        let mut counts = [0usize; 2];
        for key in 0..10_000u64 {
            // 用乘法扩散让 key 接近均匀分布
            let spread = key.wrapping_mul(0x9e3779b97f4a7c15);
            counts[jump_hash(spread, 2) as usize] += 1;
        }
        // 允许 ±10% 偏差
        assert!(counts[0] > 4000 && counts[0] < 6000, "skewed: {:?}", counts);
    }

    #[test]
    fn jump_hash_stability_on_growth() {
        // 桶数增长时，大多数 key 不迁移
        let mut moved = 0;
        for key in 0..1000u64 {
            let spread = key.wrapping_mul(0x9e3779b97f4a7c15);
            if jump_hash(spread, 10) != jump_hash(spread, 11) {
                moved += 1;
            }
        }
        assert!(moved < 200, "too many keys moved: {}", moved);
    }
}
