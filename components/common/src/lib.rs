// Copyright 2024 tansufs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

pub const TANSU: &str = "tansu";

/// The largest leaf block a file is split into.
pub const MAX_BLOCK_SIZE: usize = 512 << 10; // 512 KiB

/// Extending truncates that grow the file by more than this take the
/// hole path instead of materialising the zero region.
pub const TRUNCATE_EXTEND_CUTOFF: u64 = 128 << 10; // 128 KiB

pub const DEFAULT_MAX_FILE_BYTES: u64 = 2 << 40; // 2 TiB

/// Process-wide budget for unsynced dirty bytes.
pub const DEFAULT_DIRTY_BYTES_LIMIT: i64 = 256 << 20; // 256 MiB

/// Upper bound on concurrent block uploads during a sync.
pub const MAX_PARALLEL_BLOCK_PUTS: usize = 10;

/// How many pointers to downgrade in a single archive/delete call.
pub const NUM_POINTERS_TO_DOWNGRADE_PER_CHUNK: usize = 20;

/// Once a single gc op would delete more pointers than this, the run
/// stops at the current revision and reports itself incomplete.
pub const NUM_POINTERS_PER_GC_THRESHOLD: usize = 100;

/// The most revisions considered by one quota reclamation run.
pub const NUM_MAX_REVISIONS_PER_QR: i64 = 100;

/// Metadata revisions fetched per range call when walking history.
pub const MAX_MDS_AT_A_TIME: i64 = 100;

pub const DEFAULT_ON_DEMAND_REQUEST_PRIORITY: i32 = 100;

pub const DEFAULT_BLOCK_RETRIEVAL_WORKERS: usize = 4;

/// The internal read deadline is this much shorter than the caller's,
/// so short reads get returned before upstream cancellation fires.
pub const READ_TIMEOUT_SMALLER_BY: Duration = Duration::from_secs(2);

/// Deadline for one background archive or cleanup pass.
pub const BACKGROUND_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// Bounded retries for syncs that fail with a recoverable block error.
pub const MAX_SYNC_RETRIES: usize = 8;

pub type KeyGen = u32;
pub type DataVer = u32;
