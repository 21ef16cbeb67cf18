// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Binary entrypoint: run one overlayctl command.

fn main() {
    env_logger::init();
    overlaymgr::run();
}
