#![allow(missing_docs)]
// Copyright (c) 2026 Meshline
// Licensed under the Apache License, Version 2.0

//! Member key material: signing, verification, and the on-disk keystore.

pub mod keystore;
