#![allow(dead_code)]

pub mod rsa {
    use serde::Deserialize;

    use crate::RsaPublicKey;

    pub const KEY_ID: &str = "fixture-key-1";
    pub const PRIVATE_KEY_PEM: &str = include_str!("../data/rsa/private.pem");
    pub const JWK: &str = include_str!("../data/rsa/jwk.json");

    #[derive(Deserialize)]
    struct Components {
        n: String,
        e: String,
    }

    pub fn public_key() -> RsaPublicKey {
        let c: Components = serde_json::from_str(JWK).unwrap();
        RsaPublicKey::from_components(&c.n, &c.e).unwrap()
    }
}
