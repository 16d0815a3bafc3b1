// Copyright (c) 2026 Meshline
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Stand up a fresh community: create its master member (from this data
//! directory's keystore) and its `meta_message` rows, and optionally emit
//! a genesis `authorize` message granting another member a permission.
//!
//! ```text
//! meshline-genesis <data_dir> <classification> [<target_pubkey_hex> <meta_name> <action>]
//! ```
//! `action` is one of `permit`, `authorize`, `revoke`, `undo`.

use anyhow::{anyhow, Context, Result};
use ring::signature::KeyPair;

use meshline::core::community::{Community, MetaTemplate};
use meshline::core::pipeline::meta_tag;
use meshline::core::security::keystore::{FileEd25519Backend, SignerBackend};
use meshline::core::store::Store;
use meshline::core::types::{AuthBlock, MemberId, MetaName, Payload, PublicKey, TimelineAction};

fn parse_action(s: &str) -> Result<TimelineAction> {
    match s {
        "permit" => Ok(TimelineAction::Permit),
        "authorize" => Ok(TimelineAction::Authorize),
        "revoke" => Ok(TimelineAction::Revoke),
        "undo" => Ok(TimelineAction::Undo),
        other => Err(anyhow!("unknown action {other}")),
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 && args.len() != 6 {
        eprintln!(
            "usage: meshline-genesis <data_dir> <classification> [<target_pubkey_hex> <meta_name> <action>]"
        );
        std::process::exit(2);
    }
    let data_dir = &args[1];
    let classification = args[2].clone();

    std::fs::create_dir_all(data_dir)?;
    let mut key_path = std::path::PathBuf::from(data_dir);
    key_path.push("member.key");
    let backend = FileEd25519Backend::load_or_create(&key_path).map_err(|e| anyhow!("{e}"))?;
    let master_pk = PublicKey(backend.public_key());

    let store = Store::open(data_dir).map_err(|e| anyhow!("{e}"))?;
    let templates = vec![MetaTemplate::full_sync("message"), MetaTemplate::full_sync("authorize")];
    let mut community = Community::load_or_create(&store, master_pk, classification, &templates, true)
        .map_err(|e| anyhow!("{e}"))?;

    println!("community cid = {}", hex::encode(community.cid.0));
    println!("master public key = {}", hex::encode(master_pk.0));

    if args.len() == 6 {
        let target_bytes = hex::decode(&args[3]).context("target pubkey must be hex")?;
        let target_arr: [u8; 32] = target_bytes
            .try_into()
            .map_err(|_| anyhow!("target pubkey must be 32 bytes"))?;
        let target_member = MemberId::from_public_key(&target_arr);
        let meta_name: MetaName = args[4].clone().into();
        let action = parse_action(&args[5])?;

        let authorize_meta = community
            .meta(&"authorize".into())
            .ok_or_else(|| anyhow!("authorize meta missing"))?;
        let authorize_meta_row = authorize_meta.row_id;
        let authorize_meta_name = authorize_meta.name.clone();

        let payload = Payload::Authorize {
            target: target_member,
            meta: meta_name,
            action,
        };
        let global_time = community.next_local_gt();
        let tag = meta_tag(&authorize_meta_name);
        let message = meshline::core::codec::signing_message(
            community.cid,
            tag,
            global_time,
            None,
            false,
            &payload,
        )
        .map_err(|e| anyhow!("{e}"))?;
        let sig = backend.sign(&message).map_err(|e| anyhow!("{e}"))?;
        let auth = AuthBlock::Single {
            member: master_pk,
            signature: sig,
        };
        let packet = meshline::core::codec::encode(community.cid, tag, global_time, None, &auth, &payload)
            .map_err(|e| anyhow!("{e}"))?;

        let master_row = store
            .get_member_by_mid(community.cid)
            .map_err(|e| anyhow!("{e}"))?
            .ok_or_else(|| anyhow!("master member row missing"))?;
        store
            .put_message(
                community.cid,
                community.row_id,
                community.cid,
                master_row.id,
                global_time,
                authorize_meta_row,
                packet,
                None,
            )
            .map_err(|e| anyhow!("{e}"))?;
        println!("genesis authorize message written at global_time={global_time}");
    }

    Ok(())
}
