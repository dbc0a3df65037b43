//! Checkout path with allocation churn and no leaks.

pub struct CheckoutEngine {
    pricing_table: Vec<u64>,
}

impl CheckoutEngine {
    pub fn new() -> Self {
        let pricing_table = (0..512).map(|i| 199 + (i as u64 * 7) % 97).collect();
        Self { pricing_table }
    }

    #[inline(never)]
    pub fn handle(&self, seed: u64, flags: u8) -> Vec<u8> {
        let items = self.expand_cart(seed);
        let total: u64 = items.iter().sum();
        let discounted = apply_promos(total, flags);
        serialize_receipt(&items, discounted)
    }

    #[inline(never)]
    fn expand_cart(&self, seed: u64) -> Vec<u64> {
        let mut items = Vec::new();
        let mut idx = seed as usize % self.pricing_table.len();
        for _ in 0..12 {
            items.push(self.pricing_table[idx]);
            idx = (idx * 13 + 7) % self.pricing_table.len();
        }
        items
    }
}

fn apply_promos(total: u64, flags: u8) -> u64 {
    let mut value = total;
    if flags & 1 == 1 {
        value = value.saturating_sub(total / 10);
    }
    if flags & 2 == 2 {
        value = value.saturating_sub(total / 20);
    }
    value
}

#[inline(never)]
fn serialize_receipt(items: &[u64], total: u64) -> Vec<u8> {
    let mut out = String::new();
    for &item in items {
        out.push_str(&format!("{}|", item));
    }
    out.push_str(&format!("total={}", total));
    out.into_bytes()
}
