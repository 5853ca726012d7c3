//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum CryptoAlgo {
    ClearText,
    Md5,
    Sha1,
}

// ===== impl CryptoAlgo =====

impl CryptoAlgo {
    pub fn digest_size(&self) -> u8 {
        match self {
            CryptoAlgo::ClearText => unreachable!(),
            CryptoAlgo::Md5 => 16,
            CryptoAlgo::Sha1 => 20,
        }
    }
}
