// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use crate::runtime::row_batch::{Datum, canonical_f64_bits};

/// One seed per hashing level. Repartitioning after a spill bumps the level so
/// the same keys spread differently; the constants just need to be distinct.
pub(crate) const HASH_SEEDS: [u64; 8] = [
    0x9747b28c9747b28c,
    0x2f96b0a42f96b0a4,
    0x1a5b8e741a5b8e74,
    0x83fab3c583fab3c5,
    0x5c6dd2e15c6dd2e1,
    0xe1f0c4a9e1f0c4a9,
    0x3b9d6f823b9d6f82,
    0x7d4a91d67d4a91d6,
];

pub(crate) fn combine_hash(acc: u64, value_hash: u64) -> u64 {
    acc ^ value_hash
        .wrapping_add(0x9e3779b97f4a7c15)
        .wrapping_add(acc << 6)
        .wrapping_add(acc >> 2)
}

pub(crate) fn hash_u64_with_seed(seed: u64, value: u64) -> u64 {
    mix_u64(seed ^ value)
}

pub(crate) fn hash_bytes_with_seed(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = seed ^ 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub(crate) fn hash_null_with_seed(seed: u64) -> u64 {
    hash_u64_with_seed(seed, 0x9e3779b97f4a7c15)
}

fn mix_u64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9e3779b97f4a7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d049bb133111eb);
    value ^ (value >> 31)
}

fn fold_u32(value: u64) -> u32 {
    ((value >> 32) ^ value) as u32
}

/// Hash one pre-evaluated expression tuple. NaNs hash via their canonical bit
/// pattern so inclusive equality and hashing agree.
pub(crate) fn hash_row(values: &[Datum], seed: u64) -> u32 {
    let mut acc = seed;
    for value in values {
        let value_hash = match value {
            Datum::Null => hash_null_with_seed(seed),
            Datum::Bool(b) => hash_u64_with_seed(seed, *b as u64 + 1),
            Datum::Int(v) => hash_u64_with_seed(seed, *v as u64),
            Datum::Float(v) => hash_u64_with_seed(seed, canonical_f64_bits(*v)),
            Datum::Text(s) => hash_bytes_with_seed(seed, s.as_bytes()),
        };
        acc = combine_hash(acc, value_hash);
    }
    fold_u32(acc)
}

#[cfg(test)]
mod tests {
    use super::{HASH_SEEDS, hash_row};
    use crate::runtime::row_batch::Datum;

    #[test]
    fn equal_rows_hash_equal() {
        let a = vec![Datum::Int(42), Datum::Text("k".to_string())];
        let b = vec![Datum::Int(42), Datum::Text("k".to_string())];
        assert_eq!(hash_row(&a, HASH_SEEDS[0]), hash_row(&b, HASH_SEEDS[0]));
    }

    #[test]
    fn levels_change_the_hash() {
        let row = vec![Datum::Int(42)];
        assert_ne!(hash_row(&row, HASH_SEEDS[0]), hash_row(&row, HASH_SEEDS[1]));
    }

    #[test]
    fn nan_hashes_consistently() {
        let a = vec![Datum::Float(f64::NAN)];
        let b = vec![Datum::Float(f64::NAN)];
        assert_eq!(hash_row(&a, HASH_SEEDS[0]), hash_row(&b, HASH_SEEDS[0]));
    }
}
