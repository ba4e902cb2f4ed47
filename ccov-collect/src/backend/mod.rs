// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Build metadata sources.

pub mod pushtree;
pub mod treeherder;
