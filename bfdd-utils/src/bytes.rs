//
// Copyright (c) The Bfdd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cell::RefCell;

use bytes::BytesMut;

thread_local!(
    // Scratch buffer shared by all packet encoders running on the same
    // thread.
    pub static TLS_BUF: RefCell<BytesMut> =
        RefCell::new(BytesMut::with_capacity(65536))
);
