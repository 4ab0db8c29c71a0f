//! In-memory PDF fixtures for tests in this and dependent crates.

use lopdf::{dictionary, Document, Object, Stream};

/// Builds a valid PDF with `page_count` US-letter pages.
pub fn pdf_with_pages(page_count: u32) -> Vec<u8> {
    pdf_with_page_size(page_count, 612, 792)
}

pub fn pdf_with_page_size(page_count: u32, width_pt: i64, height_pt: i64) -> Vec<u8> {
    build(page_count, width_pt, height_pt, Vec::new(), false)
}

/// A one-page PDF whose uncompressed content stream is `content`.
pub fn pdf_with_content(content: &[u8]) -> Vec<u8> {
    build(1, 612, 792, content.to_vec(), false)
}

/// A one-page PDF whose trailer names a standard security handler.
pub fn encrypted_pdf() -> Vec<u8> {
    build(1, 612, 792, Vec::new(), true)
}

pub fn invalid_pdf() -> Vec<u8> {
    b"this is not a pdf".to_vec()
}

fn build(
    page_count: u32,
    width_pt: i64,
    height_pt: i64,
    content: Vec<u8>,
    encrypt: bool,
) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::with_capacity(page_count as usize);

    for _ in 0..page_count {
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.clone()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(width_pt),
                Object::Integer(height_pt),
            ],
        });
        kids.push(Object::Reference(page_id));
    }

    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => i64::from(page_count),
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    if encrypt {
        let encrypt_id = doc.add_object(dictionary! {
            "Filter" => "Standard",
            "V" => 1i64,
            "R" => 2i64,
            "O" => Object::string_literal(vec![0u8; 32]),
            "U" => Object::string_literal(vec![0u8; 32]),
            "P" => -4i64,
        });
        doc.trailer.set("Encrypt", encrypt_id);
    }

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("fixture PDF should serialize");
    bytes
}
