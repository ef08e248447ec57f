// Copyright 2025 CloudWeGo Authors
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

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// NotEnoughData means that the real read size < expect read size.
    ///
    /// In wait-free disciplines this is the normal "try again later" answer;
    /// waiting disciplines never return it.
    #[error("current buffer is not enough data to read")]
    NotEnoughData,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Others(#[from] anyhow::Error),
}
