// Copyright 2023 The Ledger Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire and storage schemas.
//!
//! Field presence is explicit everywhere: a missing required field or an
//! unknown union tag is a data integrity error at the decoding call site,
//! never silently defaulted.

#![allow(missing_docs)]

pub mod cloud;
pub mod p2p;
pub mod store;
