// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Transactional multi-store metadata: a list of named stores plus one
//! info file per store, guarded by an L2 advisory lock (spec.md §4.G).

mod info;
mod repository;

pub use info::StoreInfo;
pub use repository::StoreRepository;
