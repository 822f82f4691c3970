//! # Session Demo
//!
//! Two devices set up keys, exchange prekey bundles through an in-memory
//! directory, talk over the Double Ratchet and compare safety numbers.
//!
//! ## Run
//!
//! ```bash
//! cargo run --example session_demo
//! ```

use std::sync::Arc;

use umbra_e2ee::{DeviceId, E2eeClient, E2eeConfig, KdfParams, MemoryDirectory, MemoryKeyStore};

#[tokio::main]
async fn main() {
    println!("=================================================");
    println!("            UMBRA E2EE SESSION DEMO");
    println!("=================================================\n");

    let directory = Arc::new(MemoryDirectory::new());
    let config = E2eeConfig {
        kdf: KdfParams::fast_insecure(), // Demo only; keep the default for real passwords
        ..E2eeConfig::default()
    };

    // =========================================================================
    // STEP 1: Set up both devices
    // =========================================================================
    println!("1. Setting up Alice and Bob...\n");

    let alice = E2eeClient::new(
        DeviceId::new("alice-laptop"),
        Arc::new(MemoryKeyStore::new()),
        directory.clone(),
        config.clone(),
    )
    .expect("Failed to create Alice's client");
    let bob = E2eeClient::new(
        DeviceId::new("bob-phone"),
        Arc::new(MemoryKeyStore::new()),
        directory.clone(),
        config,
    )
    .expect("Failed to create Bob's client");

    let alice_identity = alice.setup("alice password").await.expect("Alice setup failed");
    bob.setup("bob password").await.expect("Bob setup failed");

    let code = alice.export_recovery_code().expect("Recovery code already exported");
    println!("   Alice identity: {}...", &alice_identity.to_hex()[..16]);
    println!("   Alice recovery code ({} words):", code.words().len());
    println!("     {}...", code.words()[..4].join(" "));
    println!();

    // =========================================================================
    // STEP 2: Publish bundles
    // =========================================================================
    println!("2. Publishing prekey bundles...\n");

    alice.publish_bundles().await.expect("Alice publish failed");
    bob.publish_bundles().await.expect("Bob publish failed");
    println!(
        "   Bundles queued for Bob: {}",
        directory.queued_bundles(bob.device_id())
    );
    println!();

    // =========================================================================
    // STEP 3: Exchange messages
    // =========================================================================
    println!("3. Exchanging messages...\n");

    alice
        .send_to_device(b"Hello Bob!", bob.device_id())
        .await
        .expect("Send failed");
    for delivery in directory.take_inbox(bob.device_id()) {
        let text = bob
            .decrypt_from_device(&delivery.envelope, &delivery.sender)
            .await
            .expect("Bob could not decrypt");
        println!(
            "   Bob received ({} bytes on the wire): {}",
            delivery.envelope.to_bytes().map(|b| b.len()).unwrap_or(0),
            String::from_utf8_lossy(&text)
        );
    }

    let reply = bob
        .encrypt_for_device(b"Hi Alice!", alice.device_id())
        .await
        .expect("Encrypt failed");
    let text = alice
        .decrypt_from_device(&reply, bob.device_id())
        .await
        .expect("Alice could not decrypt");
    println!("   Alice received: {}", String::from_utf8_lossy(&text));
    println!(
        "   Session state: {:?}",
        alice.session_state(bob.device_id()).expect("Locked")
    );
    println!();

    // =========================================================================
    // STEP 4: Compare safety numbers
    // =========================================================================
    println!("4. Comparing safety numbers...\n");

    let from_alice = alice.get_safety_number(bob.device_id()).expect("No session");
    let from_bob = bob.get_safety_number(alice.device_id()).expect("No session");
    println!("   Alice sees: {}", from_alice);
    println!("   Bob sees:   {}", from_bob);
    println!("   Match: {}", from_alice == from_bob);
    println!();

    // =========================================================================
    // STEP 5: Audit trail
    // =========================================================================
    println!("5. Alice's audit trail:\n");
    for event in alice.audit_log().events() {
        println!("   {}", event.event_type.as_str());
    }

    println!("\n=================================================");
    println!("                  DEMO COMPLETE");
    println!("=================================================");
}
