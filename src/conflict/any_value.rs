// Copyright 2025 Stoolap Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Any-value encoding
//!
//! The any-value of an operation travels with the change into the binlog.
//! Normally it carries the originating server id; reserved values mark
//! changes that must not be logged, refresh operations and reflected
//! operations.

/// Bit set on every reserved value
pub const ANYVALUE_RESERVED_BIT: u32 = 0x8000_0000;

/// Mask of the bits holding a server id
pub const ANYVALUE_SERVER_ID_MASK: u32 = 0x7fff_ffff;

pub const ANYVALUE_FOR_NOLOGGING: u32 = 0x8000_007f;
pub const ANYVALUE_REFRESH_OP: u32 = 0x8000_007e;
pub const ANYVALUE_REFLECT_OP: u32 = 0x8000_007d;

pub fn is_reserved(any_value: u32) -> bool {
    any_value & ANYVALUE_RESERVED_BIT != 0
}

pub fn is_nologging(any_value: u32) -> bool {
    any_value == ANYVALUE_FOR_NOLOGGING
}

pub fn is_refresh_op(any_value: u32) -> bool {
    any_value == ANYVALUE_REFRESH_OP
}

pub fn is_reflect_op(any_value: u32) -> bool {
    any_value == ANYVALUE_REFLECT_OP
}

pub fn set_refresh_op(any_value: &mut u32) {
    *any_value = ANYVALUE_REFRESH_OP;
}

pub fn set_reflect_op(any_value: &mut u32) {
    *any_value = ANYVALUE_REFLECT_OP;
}

/// Server id carried by a non-reserved any-value
pub fn server_id(any_value: u32) -> Option<u32> {
    if is_reserved(any_value) {
        None
    } else {
        Some(any_value & ANYVALUE_SERVER_ID_MASK)
    }
}
